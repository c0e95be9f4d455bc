//! Capture configuration
//!
//! Settings come from an optional toml file and are overridden by command
//! line flags. Every field has a default, so an empty file is valid:
//!
//! ```toml
//! source_flow = "render"      # loopback of the default render device
//! stdout = true
//! sample_rate = 48000
//!
//! [network]
//! enabled = true
//! peer_address = "239.255.77.77"
//! peer_service = "4010"
//!
//! [shared_memory]
//! name = "pcm-relay-ctl"
//! averaging = false
//! ```

use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::audio::device::{DataFlow, DeviceState, Role};
use crate::audio::format::ChannelMask;
use crate::constants::MAX_CHANNELS;
use crate::error::ConfigError;
use crate::network::NetworkTarget;
use crate::protocol::{adjust_sample_rate, rate_code};

/// Playback destination
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub enabled: bool,
    /// Device id, the default device for `role` if unset
    pub device: Option<String>,
    pub role: Role,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: None,
            role: Role::Console,
        }
    }
}

/// UDP destination
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub target: NetworkTarget,
}

/// Shared-memory control block
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Control block name, no control stages if unset
    pub name: Option<String>,
    pub tap: bool,
    pub averaging: bool,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            name: None,
            tap: true,
            averaging: true,
        }
    }
}

/// Everything `capture` needs to assemble and run a pipeline
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source device id, the default device for flow and role if unset
    pub source_device: Option<String>,
    pub source_flow: DataFlow,
    pub source_role: Role,
    pub render: RenderConfig,
    pub network: NetworkConfig,
    pub stdout: bool,
    pub shared_memory: SharedMemoryConfig,
    /// Chain sample rate, the source's if unset
    pub sample_rate: Option<u32>,
    /// Chain channel mask, the source's if unset
    pub channel_mask: Option<u32>,
    /// Seconds to run, unbounded if unset
    pub duration: Option<f64>,
    /// Exit once this process id is gone
    pub lifetime: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source_device: None,
            source_flow: DataFlow::Render,
            source_role: Role::Console,
            render: RenderConfig::default(),
            network: NetworkConfig::default(),
            stdout: false,
            shared_memory: SharedMemoryConfig::default(),
            sample_rate: None,
            channel_mask: None,
            duration: None,
            lifetime: None,
        }
    }
}

impl CaptureConfig {
    /// Parse a toml configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Load `capture.toml` from the user configuration directory, defaults
    /// if there is none
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Chain mask requested by `channel_mask`, if any
    pub fn chain_mask(&self) -> Option<ChannelMask> {
        self.channel_mask.map(ChannelMask)
    }

    /// Set the chain layout to the lowest `channels` positions
    pub fn set_channels(&mut self, channels: u32) -> Result<(), ConfigError> {
        check_channel_count(channels)?;
        self.channel_mask = Some(ChannelMask::low_bits(channels).bits());
        Ok(())
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mask) = self.chain_mask() {
            check_channel_count(mask.channels() as u32)?;
        }
        if self.sample_rate == Some(0) {
            return Err(ConfigError::UnsupportedSampleRate(0));
        }
        if let Some(duration) = self.duration {
            if duration.is_nan() || duration < 0.0 {
                return Err(ConfigError::Conflict(format!(
                    "duration must be non-negative, got {}",
                    duration
                )));
            }
        }
        if let (true, Some(rate)) = (self.network.enabled, self.sample_rate) {
            rate_code(adjust_sample_rate(rate))?;
        }
        if self.source_device.is_none() && self.source_flow == DataFlow::All {
            return Err(ConfigError::Conflict(
                "no default source device for flow \"all\"".into(),
            ));
        }
        Ok(())
    }
}

fn check_channel_count(channels: u32) -> Result<(), ConfigError> {
    if channels == 0 {
        Err(ConfigError::TooFewChannels(channels))
    } else if channels as usize > MAX_CHANNELS {
        Err(ConfigError::TooManyChannels(channels))
    } else {
        Ok(())
    }
}

/// `<config dir>/pcm-relay/capture.toml`
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "pcm-relay").map(|dirs| dirs.config_dir().join("capture.toml"))
}

/// Settings for `list`
#[derive(Debug, Clone, PartialEq)]
pub struct ListConfig {
    pub flow: DataFlow,
    /// States to include, all if empty
    pub states: Vec<DeviceState>,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            flow: DataFlow::All,
            states: Vec::new(),
        }
    }
}
