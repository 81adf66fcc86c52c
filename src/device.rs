//! # Audio Device Selection
//!
//! Resolves the configured input/output device names to cpal devices on the
//! default host, falling back to the host default when a named device is not
//! present. Also produces the device inventory reported by the health endpoint.

use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Which device to open for a direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// The host's default device
    #[default]
    Default,
    /// A device whose name matches exactly (falls back to default if absent)
    Named(String),
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "default" | "auto" => Ok(DevicePreference::Default),
            _ => Ok(DevicePreference::Named(trimmed.to_string())),
        }
    }
}

impl DevicePreference {
    /// Parse a config value; parsing never fails.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

/// Devices visible on the default host.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInventory {
    pub host: String,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

pub struct DeviceManager;

impl DeviceManager {
    /// Resolve the microphone for a capture stream.
    pub fn input_device(preference: &DevicePreference) -> Result<cpal::Device, PipelineError> {
        let host = cpal::default_host();

        if let DevicePreference::Named(name) = preference {
            match host.input_devices() {
                Ok(mut devices) => {
                    if let Some(device) = devices.find(|d| d.name().map(|n| n == *name).unwrap_or(false)) {
                        info!(device = %name, "Using configured input device");
                        return Ok(device);
                    }
                    warn!(device = %name, "Configured input device not found, using default");
                }
                Err(e) => warn!("Failed to enumerate input devices: {}", e),
            }
        }

        host.default_input_device()
            .ok_or_else(|| PipelineError::Device("no input device available".to_string()))
    }

    /// Resolve the speaker device for the playback mixer.
    pub fn output_device(preference: &DevicePreference) -> Result<cpal::Device, PipelineError> {
        let host = cpal::default_host();

        if let DevicePreference::Named(name) = preference {
            match host.output_devices() {
                Ok(mut devices) => {
                    if let Some(device) = devices.find(|d| d.name().map(|n| n == *name).unwrap_or(false)) {
                        info!(device = %name, "Using configured output device");
                        return Ok(device);
                    }
                    warn!(device = %name, "Configured output device not found, using default");
                }
                Err(e) => warn!("Failed to enumerate output devices: {}", e),
            }
        }

        host.default_output_device()
            .ok_or_else(|| PipelineError::Device("no output device available".to_string()))
    }

    /// Enumerate devices on the default host. Enumeration errors yield empty lists.
    pub fn inventory() -> DeviceInventory {
        let host = cpal::default_host();
        debug!(host = ?host.id(), "Enumerating audio devices");

        let inputs = host
            .input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();
        let outputs = host
            .output_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();

        DeviceInventory {
            host: format!("{:?}", host.id()),
            default_input: host.default_input_device().and_then(|d| d.name().ok()),
            default_output: host.default_output_device().and_then(|d| d.name().ok()),
            inputs,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_from_str() {
        assert_eq!("default".parse::<DevicePreference>().unwrap(), DevicePreference::Default);
        assert_eq!("".parse::<DevicePreference>().unwrap(), DevicePreference::Default);
        assert_eq!("AUTO".parse::<DevicePreference>().unwrap(), DevicePreference::Default);
        assert_eq!(
            " USB Microphone ".parse::<DevicePreference>().unwrap(),
            DevicePreference::Named("USB Microphone".to_string())
        );
    }
}
