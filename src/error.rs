//! Error types for the capture relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Shared control error: {0}")]
    Control(#[from] ControlError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Cannot render to capture device {0}")]
    NotARenderDevice(String),

    #[error("Incompatible sink: source is {source_format}, chain expects {sink_format}")]
    IncompatibleSink {
        source_format: String,
        sink_format: String,
    },

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Address resolution failed for {0}")]
    ResolveFailed(String),

    #[error("Socket creation failed: {0}")]
    SocketFailed(String),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid packet format")]
    InvalidPacket,
}

/// Shared-memory control block errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to open shared memory {name}: {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Failed to map shared memory {name}: {reason}")]
    MapFailed { name: String, reason: String },

    #[error("Shared memory {name} is too small: {size} bytes, need at least {required}")]
    TooSmall {
        name: String,
        size: usize,
        required: usize,
    },
}

/// Configuration errors, raised before the pipeline starts
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid sample rate {0} Hz (unrecognized base rate)")]
    UnsupportedSampleRate(u32),

    #[error("Invalid sample rate {rate} Hz ({base} Hz * {multiplier})")]
    SampleRateMultiplier { rate: u32, base: u32, multiplier: u32 },

    #[error("Too few channels: {0}")]
    TooFewChannels(u32),

    #[error("Too many channels: {0}")]
    TooManyChannels(u32),

    #[error("Conflicting options: {0}")]
    Conflict(String),

    #[error("Unable to play: no destination accepts audio")]
    UnableToPlay,

    #[error("Failed to parse configuration file {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
