//! Windowed multi-channel acquisition for streaming DAQ devices.
//!
//! One background thread per device streams raw packets into a buffer until
//! an integration window is full, then hands the window to a polling consumer
//! and waits for the next request. The consumer can reconfigure channels,
//! rate and integration time at any point; a running acquisition is stopped
//! and restarted so no window ever mixes two configurations.
//!
//! # Windows and timing
//!
//! A window is complete once `integration_time × rate × channels` samples
//! (summed over channels) have arrived. Packets rarely end on a scan
//! boundary, so per-channel lengths in a window may differ slightly; use
//! [`Window::truncated`] when equal lengths are needed. Dropped samples
//! reported by the device are summed into [`Window::dropped`].

mod buffer;
mod config;
mod controller;
mod decoder;
mod device;
mod errors;
mod handshake;
pub mod logging;
mod store;
mod window;

#[cfg(feature = "python")]
mod python;

pub use buffer::{Drained, PacketBuffer};
pub use config::{
    max_rate_for, rate_choices, ChannelId, Configuration, DEFAULT_INTEGRATION_SECS,
    DEFAULT_SAMPLE_RATE, MAX_AGGREGATE_RATE, MAX_INTEGRATION_SECS,
};
pub use controller::{AcquisitionController, ControllerOptions, Monitor, DEFAULT_POLL_TIMEOUT};
pub use decoder::decode;
pub use device::{
    connect_with, CallLog, ChannelSamples, Connector, DeviceCall, DevicePort, Pacing, RawPacket,
    ScriptStep, SimulatedDevice,
};
pub use errors::*;
pub use handshake::{Handshake, RunState, Wake};
pub use store::CaptureStore;
pub use window::{Capture, Scaling, Window};
