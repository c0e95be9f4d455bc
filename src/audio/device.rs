//! Audio device enumeration and lookup
//!
//! Devices are identified as `render:<name>` or `capture:<name>`. The
//! platform layer has no notion of device roles or inactive endpoints, so
//! every enumerated device is active and every role resolves to the host's
//! default device for the flow.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Deserialize;
use std::fmt;
use std::io::{self, Write};

use crate::audio::format::{ChannelMask, StreamFormat};
use crate::error::AudioError;

/// Direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DataFlow {
    Render,
    Capture,
    All,
}

impl DataFlow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Capture => "capture",
            Self::All => "all",
        }
    }

    fn includes(self, other: DataFlow) -> bool {
        self == Self::All || self == other
    }
}

impl fmt::Display for DataFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default-device role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Console,
    Multimedia,
    Communications,
}

impl Role {
    pub const ALL: [Role; 3] = [Self::Console, Self::Multimedia, Self::Communications];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Multimedia => "multimedia",
            Self::Communications => "communications",
        }
    }
}

/// Endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::NotPresent => "not-present",
            Self::Unplugged => "unplugged",
        }
    }

    fn bit(self) -> u32 {
        match self {
            Self::Active => 0x1,
            Self::Disabled => 0x2,
            Self::NotPresent => 0x4,
            Self::Unplugged => 0x8,
        }
    }
}

/// Set of device states to enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u32);

impl StateMask {
    pub const ALL: StateMask = StateMask(0xf);

    /// Mask of `states`, all states if empty
    pub fn from_states(states: &[DeviceState]) -> Self {
        match states {
            [] => Self::ALL,
            states => StateMask(states.iter().fold(0, |mask, s| mask | s.bit())),
        }
    }

    pub fn contains(self, state: DeviceState) -> bool {
        self.0 & state.bit() != 0
    }
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub id: String,
    pub name: String,
    pub flow: DataFlow,
}

impl AudioDevice {
    fn from_cpal(device: cpal::Device, flow: DataFlow) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            id: device_id(flow, &name),
            inner: device,
            name,
            flow,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::Active
    }

    /// Native stream configuration of the endpoint. Render endpoints report
    /// their output configuration, which is also what loopback captures.
    pub fn default_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let config = match self.flow {
            DataFlow::Capture => self.inner.default_input_config(),
            _ => self.inner.default_output_config(),
        };
        config.map_err(|e| AudioError::CpalError(format!("{}: {}", self.id, e)))
    }

    /// Shared-mode mix format of the endpoint
    pub fn mix_format(&self) -> Result<StreamFormat, AudioError> {
        let config = self.default_config()?;
        Ok(StreamFormat::new(
            config.sample_rate().0,
            ChannelMask::for_channel_count(config.channels()),
        ))
    }
}

fn device_id(flow: DataFlow, name: &str) -> String {
    format!("{}:{}", flow, name)
}

/// Enumerate devices of `flow` whose state is in `states`
pub fn enumerate(flow: DataFlow, states: StateMask) -> Result<Vec<AudioDevice>, AudioError> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    if !states.contains(DeviceState::Active) {
        return Ok(devices);
    }

    if flow.includes(DataFlow::Render) {
        let outputs = host
            .output_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        devices.extend(outputs.map(|d| AudioDevice::from_cpal(d, DataFlow::Render)));
    }

    if flow.includes(DataFlow::Capture) {
        let inputs = host
            .input_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        devices.extend(inputs.map(|d| AudioDevice::from_cpal(d, DataFlow::Capture)));
    }

    Ok(devices)
}

/// Default device for `flow` and `role`
pub fn default_device(flow: DataFlow, _role: Role) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    let device = match flow {
        DataFlow::Render => host.default_output_device(),
        DataFlow::Capture => host.default_input_device(),
        DataFlow::All => None,
    };

    device
        .map(|d| AudioDevice::from_cpal(d, flow))
        .ok_or_else(|| AudioError::DeviceNotFound(format!("default {} device", flow)))
}

/// Look up a device by its id
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let (flow, name) = if let Some(name) = id.strip_prefix("render:") {
        (DataFlow::Render, name)
    } else if let Some(name) = id.strip_prefix("capture:") {
        (DataFlow::Capture, name)
    } else {
        return Err(AudioError::DeviceNotFound(id.to_string()));
    };

    enumerate(flow, StateMask::ALL)?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

/// One record of the device listing
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub flow: DataFlow,
    pub state: DeviceState,
    /// Mix format, `None` unless active
    pub format: Option<StreamFormat>,
    pub default_roles: Vec<Role>,
}

/// Describe all devices of `flow` in `states`
pub fn list_devices(flow: DataFlow, states: StateMask) -> Result<Vec<DeviceInfo>, AudioError> {
    let default_ids: Vec<(DataFlow, String)> = [DataFlow::Render, DataFlow::Capture]
        .into_iter()
        .filter(|f| flow.includes(*f))
        .filter_map(|f| default_device(f, Role::Console).ok().map(|d| (f, d.id)))
        .collect();

    let devices = enumerate(flow, states)?;
    let mut infos = Vec::with_capacity(devices.len());
    for device in devices {
        let state = device.state();
        let format = match state {
            DeviceState::Active => match device.mix_format() {
                Ok(format) => Some(format),
                Err(e) => {
                    tracing::debug!("No mix format for {}: {}", device.id, e);
                    None
                }
            },
            _ => None,
        };

        let is_default = default_ids
            .iter()
            .any(|(f, id)| *f == device.flow && *id == device.id);
        let default_roles = if is_default {
            Role::ALL.to_vec()
        } else {
            Vec::new()
        };

        infos.push(DeviceInfo {
            id: device.id,
            name: device.name,
            flow: device.flow,
            state,
            format,
            default_roles,
        });
    }

    Ok(infos)
}

/// Lines per record in the listing
pub const LISTING_RECORD_LINES: usize = 7;

/// Line-oriented listing: the record length, then per device its id, name,
/// flow, state, sample rate, decimal channel mask and default roles.
pub fn write_listing<W: Write>(out: &mut W, devices: &[DeviceInfo]) -> io::Result<()> {
    writeln!(out, "{}", LISTING_RECORD_LINES)?;
    for device in devices {
        let (sample_rate, channel_mask) = device
            .format
            .map(|f| (f.sample_rate, f.channel_mask.bits()))
            .unwrap_or((0, 0));
        let roles: Vec<&str> = device.default_roles.iter().map(|r| r.as_str()).collect();

        writeln!(out, "{}", device.id)?;
        writeln!(out, "{}", device.name)?;
        writeln!(out, "{}", device.flow)?;
        writeln!(out, "{}", device.state.as_str())?;
        writeln!(out, "{}", sample_rate)?;
        writeln!(out, "{}", channel_mask)?;
        writeln!(out, "{}", roles.join(" "))?;
    }
    out.flush()
}
