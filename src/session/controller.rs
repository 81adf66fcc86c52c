//! # Call Controller
//!
//! The single owner of all mutable call state. Every input to the pipeline
//! arrives as an [`Event`] on one ordered channel and is handled to completion
//! before the next one is looked at:
//!
//! - commands from the control surface (`start`, `stop`, `shutdown`)
//! - the result of an in-flight session open
//! - callbacks of the open session (opened, message, error, closed)
//! - microphone frames from the capture callback
//! - playback completions from the output callback
//!
//! Session-scoped events carry the generation of the call that produced them.
//! Each start and each teardown bumps the generation, so late frames and
//! callbacks of a replaced session are dropped instead of leaking into the
//! current one.
//!
//! The controller runs on its own thread inside a `LocalSet` because cpal
//! streams cannot leave the thread that created them. Other threads talk to it
//! through a cloneable [`CallHandle`].

use crate::audio::capture::{CaptureDevice, CaptureStream, CpalCapture, FrameSink};
use crate::audio::codec::{self, WireAudioPayload};
use crate::audio::frame::AudioFrame;
use crate::audio::level::{LevelReading, LevelTaps};
use crate::audio::output::{BufferId, CompletionSink, CpalOutput};
use crate::audio::scheduler::PlaybackScheduler;
use crate::config::AppConfig;
use crate::device::DevicePreference;
use crate::error::PipelineError;
use crate::session::gemini::GeminiConnector;
use crate::session::protocol::{ConnectRequest, ServerMessage};
use crate::session::state::{CallSnapshot, CallState, CallStats, StatusBoard};
use crate::session::transport::{LiveConnector, LiveSession, SessionEvent, SessionEventSink};
use chrono::Utc;
use std::ops::ControlFlow;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::LocalSet;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const STATUS_STARTING: &str = "Starting call...";
const STATUS_REQUESTING_MIC: &str = "Requesting microphone access...";
const STATUS_CAPTURING: &str = "Microphone access granted. Capturing audio...";
const STATUS_CONNECTED: &str = "Call connected.";
const STATUS_ENDING: &str = "Ending call...";
const STATUS_ENDED: &str = "Call ended. Click Start Call to begin again.";

pub type StartReply = oneshot::Sender<Result<CallSnapshot, PipelineError>>;

pub enum Command {
    Start(StartReply),
    Stop(oneshot::Sender<CallSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

pub enum Event {
    Command(Command),
    Connected {
        generation: u64,
        result: Result<Box<dyn LiveSession>, PipelineError>,
    },
    Session {
        generation: u64,
        event: SessionEvent,
    },
    Frame(AudioFrame),
    PlaybackFinished(BufferId),
}

/// Cloneable, thread-safe front door to the controller.
#[derive(Debug, Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<Event>,
    snapshots: watch::Receiver<CallSnapshot>,
    levels: LevelTaps,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Command(Command::Start(_)) => f.write_str("Command(Start)"),
            Event::Command(Command::Stop(_)) => f.write_str("Command(Stop)"),
            Event::Command(Command::Shutdown(_)) => f.write_str("Command(Shutdown)"),
            Event::Connected { generation, result } => f
                .debug_struct("Connected")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            Event::Session { generation, event } => f
                .debug_struct("Session")
                .field("generation", generation)
                .field("event", event)
                .finish(),
            Event::Frame(frame) => f.debug_tuple("Frame").field(&frame.generation).finish(),
            Event::PlaybackFinished(id) => f.debug_tuple("PlaybackFinished").field(id).finish(),
        }
    }
}

impl CallHandle {
    /// Begin a call. Resolves once the microphone is live or the start failed.
    pub async fn start_call(&self) -> Result<CallSnapshot, PipelineError> {
        let (reply, answer) = oneshot::channel();
        self.events
            .send(Event::Command(Command::Start(reply)))
            .map_err(|_| PipelineError::ControllerUnavailable)?;
        answer.await.map_err(|_| PipelineError::ControllerUnavailable)?
    }

    /// End the current call. Safe to call at any time.
    pub async fn end_call(&self) -> Result<CallSnapshot, PipelineError> {
        let (reply, answer) = oneshot::channel();
        self.events
            .send(Event::Command(Command::Stop(reply)))
            .map_err(|_| PipelineError::ControllerUnavailable)?;
        answer.await.map_err(|_| PipelineError::ControllerUnavailable)
    }

    /// End any call and stop the controller thread.
    pub async fn shutdown(&self) {
        let (reply, answer) = oneshot::channel();
        if self.events.send(Event::Command(Command::Shutdown(reply))).is_ok() {
            let _ = answer.await;
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever the visible call state changes.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    pub fn levels(&self) -> LevelReading {
        self.levels.reading()
    }
}

/// Start the controller thread with real audio devices and the Gemini transport.
///
/// Fails if the output device cannot be opened; the microphone is only
/// acquired when a call starts.
pub fn spawn(config: Arc<RwLock<AppConfig>>, levels: LevelTaps) -> anyhow::Result<CallHandle> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), PipelineError>>();

    let thread_events = events_tx.clone();
    let thread_levels = levels.clone();

    std::thread::Builder::new()
        .name("call-controller".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(PipelineError::Device(format!("controller runtime: {}", e))));
                    return;
                }
            };

            let audio = read_config(&config).audio;
            let completion_events = thread_events.clone();
            let completion: CompletionSink = Arc::new(move |id| {
                let _ = completion_events.send(Event::PlaybackFinished(id));
            });

            let output = match CpalOutput::open(
                &DevicePreference::from_config(&audio.output_device),
                audio.output_gain,
                thread_levels.output.clone(),
                completion,
            ) {
                Ok(output) => output,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let capture = CpalCapture::new(
                DevicePreference::from_config(&audio.input_device),
                audio.input_sample_rate,
                audio.block_size,
                thread_levels.input.clone(),
            );

            let controller = CallController::new(
                config,
                Box::new(GeminiConnector),
                Box::new(capture),
                PlaybackScheduler::new(Box::new(output), audio.output_sample_rate),
                thread_levels,
                thread_events,
                snapshot_tx,
            );

            let _ = ready_tx.send(Ok(()));
            let local = LocalSet::new();
            local.block_on(&runtime, controller.run(events_rx));
            info!("Call controller stopped");
        })?;

    ready_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("call controller exited during startup"))??;

    Ok(CallHandle {
        events: events_tx,
        snapshots: snapshot_rx,
        levels,
    })
}

fn read_config(config: &RwLock<AppConfig>) -> AppConfig {
    match config.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub struct CallController {
    config: Arc<RwLock<AppConfig>>,
    connector: Box<dyn LiveConnector>,
    capture_device: Box<dyn CaptureDevice>,
    scheduler: PlaybackScheduler,
    levels: LevelTaps,
    events: mpsc::UnboundedSender<Event>,
    snapshots: watch::Sender<CallSnapshot>,

    state: CallState,
    board: StatusBoard,
    generation: u64,
    call_id: Option<Uuid>,
    session: Option<Box<dyn LiveSession>>,
    capture: Option<Box<dyn CaptureStream>>,
    is_call_active: bool,
    /// `setupComplete` arrived before the session object was installed.
    remote_opened: bool,
    pending_start: Option<StartReply>,
    stats: CallStats,
}

impl CallController {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        connector: Box<dyn LiveConnector>,
        capture_device: Box<dyn CaptureDevice>,
        scheduler: PlaybackScheduler,
        levels: LevelTaps,
        events: mpsc::UnboundedSender<Event>,
        snapshots: watch::Sender<CallSnapshot>,
    ) -> Self {
        Self {
            config,
            connector,
            capture_device,
            scheduler,
            levels,
            events,
            snapshots,
            state: CallState::Idle,
            board: StatusBoard::default(),
            generation: 0,
            call_id: None,
            session: None,
            capture: None,
            is_call_active: false,
            remote_opened: false,
            pending_start: None,
            stats: CallStats::default(),
        }
    }

    /// Consume events until shutdown. Must run inside a `LocalSet`.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        info!("Call controller running");
        self.publish();
        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
    }

    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        trace!(?event, "Controller event");
        let flow = match event {
            Event::Command(Command::Start(reply)) => {
                self.start(reply);
                ControlFlow::Continue(())
            }
            Event::Command(Command::Stop(reply)) => {
                self.stop();
                let _ = reply.send(self.snapshot());
                ControlFlow::Continue(())
            }
            Event::Command(Command::Shutdown(reply)) => {
                self.stop();
                let _ = reply.send(());
                ControlFlow::Break(())
            }
            Event::Connected { generation, result } => {
                self.connected(generation, result);
                ControlFlow::Continue(())
            }
            Event::Session { generation, event } => {
                self.session_event(generation, event);
                ControlFlow::Continue(())
            }
            Event::Frame(frame) => {
                self.frame(frame);
                ControlFlow::Continue(())
            }
            Event::PlaybackFinished(id) => {
                self.scheduler.finished(id);
                ControlFlow::Continue(())
            }
        };
        self.publish();
        flow
    }

    fn start(&mut self, reply: StartReply) {
        if !self.state.can_start() {
            debug!(state = %self.state, "Start ignored, call already in progress");
            let _ = reply.send(Err(PipelineError::CallActive));
            return;
        }
        self.pending_start = Some(reply);
        self.board.set_status(STATUS_STARTING);

        let config = read_config(&self.config);
        self.scheduler.output_mut().set_gain(config.audio.output_gain);
        if let Err(e) = self.scheduler.output_mut().resume() {
            self.fail_start(e);
            return;
        }

        // Leftovers of a previous call that ended remotely or with an error
        if let Some(mut previous) = self.session.take() {
            if let Err(e) = previous.close() {
                warn!(error = %e, "Failed to close previous session");
            }
        }
        self.release_capture();
        self.scheduler.stop_all();

        self.generation += 1;
        let call_id = Uuid::new_v4();
        self.call_id = Some(call_id);
        self.stats.calls_started += 1;
        self.scheduler.reset_clock_to_now();
        self.remote_opened = false;
        self.state = CallState::Connecting;
        info!(%call_id, generation = self.generation, "Starting call");

        let generation = self.generation;
        let session_events = self.events.clone();
        let sink: SessionEventSink = Arc::new(move |event| {
            let _ = session_events.send(Event::Session { generation, event });
        });

        let request = ConnectRequest {
            model: config.remote.model.clone(),
            voice_name: config.voice.voice_name.clone(),
            language_code: config.voice.language_code.clone(),
            system_instruction: config.voice.system_instruction.clone(),
        };
        let opening = self.connector.connect(config.session_url(), request, sink);
        let timeout = Duration::from_secs(config.remote.connect_timeout_secs);
        let results = self.events.clone();

        tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(timeout, opening).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Connection(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                ))),
            };
            let _ = results.send(Event::Connected { generation, result });
        });
    }

    fn connected(&mut self, generation: u64, result: Result<Box<dyn LiveSession>, PipelineError>) {
        if generation != self.generation || self.state != CallState::Connecting {
            if let Ok(mut stale) = result {
                debug!(generation, "Closing session opened for a replaced call");
                if let Err(e) = stale.close() {
                    debug!(error = %e, "Stale session close failed");
                }
            }
            return;
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.fail_start(e);
                return;
            }
        };
        self.session = Some(session);
        self.state = CallState::Open;
        self.board.set_status(STATUS_REQUESTING_MIC);

        let frames = self.events.clone();
        let sink: FrameSink = Arc::new(move |frame| {
            let _ = frames.send(Event::Frame(frame));
        });

        match self.capture_device.open(generation, sink) {
            Ok(stream) => {
                self.capture = Some(stream);
                self.is_call_active = true;
                self.board.set_status(STATUS_CAPTURING);
                info!(generation, "Microphone capture started");
                if self.remote_opened {
                    self.enter_streaming();
                }
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(self.snapshot()));
                }
            }
            Err(e) => self.fail_start(e),
        }
    }

    fn enter_streaming(&mut self) {
        self.state = CallState::Streaming;
        self.board.set_status(STATUS_CONNECTED);
        info!(generation = self.generation, "Call connected");
    }

    fn session_event(&mut self, generation: u64, event: SessionEvent) {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Dropping event of replaced session");
            return;
        }

        match event {
            SessionEvent::Opened => match self.state {
                CallState::Connecting => self.remote_opened = true,
                CallState::Open => self.enter_streaming(),
                _ => debug!(state = %self.state, "Ignoring late session open"),
            },
            SessionEvent::Message(message) => self.server_message(message),
            SessionEvent::Error(message) => {
                error!(error = %message, "Live session error");
                if self.pending_start.is_some() {
                    self.fail_start(PipelineError::Connection(message));
                    return;
                }
                self.state = CallState::Error(message.clone());
                self.board.set_error(message);
            }
            SessionEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "Unknown reason".to_string());
                info!(%reason, "Live session closed");
                if self.pending_start.is_some() {
                    self.fail_start(PipelineError::Connection(format!("session closed: {}", reason)));
                    return;
                }
                self.is_call_active = false;
                self.release_capture();
                self.state = CallState::Closed;
                self.board.set_status(format!("Call closed: {}", reason));
            }
        }
    }

    fn server_message(&mut self, message: ServerMessage) {
        if let Some(blob) = message.audio() {
            let scheduled = WireAudioPayload::from_base64(blob.mime_type.clone(), &blob.data)
                .and_then(|payload| self.scheduler.schedule_payload(&payload));
            match scheduled {
                Ok(Some(_)) => self.stats.chunks_scheduled += 1,
                Ok(None) => {}
                Err(e @ PipelineError::MalformedPayload(_)) => {
                    self.stats.chunks_malformed += 1;
                    warn!(error = %e, "Dropping inbound audio chunk");
                }
                Err(e) => warn!(error = %e, "Failed to schedule inbound audio"),
            }
        }

        if message.interrupted() {
            let stopped = self.scheduler.interrupt();
            self.stats.interruptions += 1;
            info!(stopped, "Playback interrupted by remote engine");
        }

        if message.turn_complete() {
            debug!("Model turn complete");
        }
    }

    fn frame(&mut self, frame: AudioFrame) {
        if frame.generation != self.generation || !self.state.is_streaming() {
            self.stats.frames_dropped += 1;
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.stats.frames_dropped += 1;
            return;
        };

        let payload = codec::encode_frame(&frame);
        match session.send_realtime_input(&payload) {
            Ok(()) => self.stats.frames_sent += 1,
            Err(e) => {
                error!(error = %e, "Failed to send microphone frame");
                self.stats.frames_dropped += 1;
                self.state = CallState::Error(e.to_string());
                self.board.set_error(e.to_string());
            }
        }
    }

    /// End the call. A no-op when nothing is running.
    fn stop(&mut self) {
        let has_resources = self.session.is_some()
            || self.capture.is_some()
            || self.pending_start.is_some()
            || self.is_call_active
            || self.scheduler.active_len() > 0;
        if !has_resources {
            debug!(state = %self.state, "Stop requested with no active call");
            return;
        }

        info!(generation = self.generation, "Ending call");
        self.board.set_status(STATUS_ENDING);
        self.state = CallState::Closing;
        self.publish();

        self.teardown();
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(PipelineError::Cancelled));
        }

        self.state = CallState::Closed;
        self.board.set_status(STATUS_ENDED);
    }

    fn fail_start(&mut self, err: PipelineError) {
        error!(error = %err, "Call start failed");
        self.teardown();
        self.state = CallState::Error(err.to_string());
        self.board.set_error(err.to_string());
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(err));
        }
    }

    /// Release everything a call holds. Each step is independent.
    fn teardown(&mut self) {
        self.is_call_active = false;
        self.release_capture();

        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                let failure = PipelineError::Teardown {
                    step: "close_session",
                    message: e.to_string(),
                };
                warn!(error = %failure, "Teardown step failed");
            }
        }

        let stopped = self.scheduler.stop_all();
        self.generation += 1;
        self.remote_opened = false;
        self.levels.reset();
        debug!(stopped, generation = self.generation, "Call resources released");
    }

    fn release_capture(&mut self) {
        let Some(mut capture) = self.capture.take() else {
            return;
        };
        if let Err(e) = capture.detach() {
            let failure = PipelineError::Teardown {
                step: "detach_capture",
                message: e.to_string(),
            };
            warn!(error = %failure, "Teardown step failed");
        }
        if let Err(e) = capture.release() {
            let failure = PipelineError::Teardown {
                step: "release_capture",
                message: e.to_string(),
            };
            warn!(error = %failure, "Teardown step failed");
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.map(|id| id.to_string()),
            state: self.state.as_str().to_string(),
            is_call_active: self.is_call_active,
            status: self.board.status().to_string(),
            error: self.board.error().to_string(),
            active_buffers: self.scheduler.active_len(),
            next_start_time: self.scheduler.next_start_time(),
            stats: self.stats,
            updated_at: Utc::now(),
        }
    }

    /// Update the shared snapshot; observers are woken only for visible changes.
    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(move |current| {
            let visible = current.state != next.state
                || current.status != next.status
                || current.error != next.error
                || current.is_call_active != next.is_call_active
                || current.call_id != next.call_id
                || current.active_buffers != next.active_buffers;
            *current = next;
            visible
        });
    }
}
