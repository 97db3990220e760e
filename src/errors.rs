use std::io;
use thiserror::Error;

use crate::config::ChannelId;

/// Rejected configuration. Raised synchronously, never crosses the thread boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no channels selected")]
    EmptyChannels,
    #[error("channel {0} listed more than once")]
    DuplicateChannel(ChannelId),
    #[error("sample rate must be greater than zero")]
    InvalidRate,
    #[error("integration time must be between 0 and 3600 seconds")]
    InvalidIntegrationTime,
    #[error("sample rate {rate} too high for {channels} channels (aggregate limit {max} S/s)")]
    AggregateRateExceeded { rate: u32, channels: usize, max: u32 },
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream configuration failed: {0}")]
    Configure(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("device not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no hardware connected: {0}")]
    NoDevice(#[source] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("previous acquisition thread has not exited yet")]
    PreviousRunPending,
    #[error("could not spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed capture: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognised channel label {0:?}")]
    BadChannelLabel(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
