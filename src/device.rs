//! Device port: the boundary between the acquisition controller and hardware.
//!
//! The controller only ever talks to a [`DevicePort`]. A real driver (or the
//! Python-implemented port behind the `python` feature) plugs in here;
//! [`SimulatedDevice`] stands in when no hardware is attached.
//!
//! # Packets
//!
//! A [`RawPacket`] is whatever the device delivered in one `next_packet` call,
//! still undecoded. `num_samples` counts samples across all channels, which is
//! what the integration target is measured in. Packet boundaries need not fall
//! on scan boundaries, so after decoding a window the per-channel lengths can
//! differ by one.

use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::config::ChannelId;
use crate::errors::{DeviceError, Result};

/// Decoded samples of one or more packets, keyed by channel.
pub type ChannelSamples = BTreeMap<ChannelId, Vec<f64>>;

/// Opens a device. Called lazily by the controller on the first `start()`.
pub type Connector<D> = Box<dyn FnMut() -> Result<D> + Send>;

/// Connector that runs `connect` on `device` every time it is called and hands
/// the device out on the first success. A failed attempt keeps the device, so
/// a later `start()` retries.
pub fn connect_with<D, F>(device: D, mut connect: F) -> Connector<D>
where
    D: Send + 'static,
    F: FnMut(&mut D) -> Result<()> + Send + 'static,
{
    let mut slot = Some(device);
    Box::new(move || {
        let device = slot
            .as_mut()
            .ok_or_else(|| DeviceError::Connect("device already bound".into()))?;
        connect(device)?;
        slot.take()
            .ok_or_else(|| DeviceError::Connect("device already bound".into()))
    })
}

/// One undecoded transfer from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Samples carried, summed over all channels.
    pub num_samples: usize,
    /// Samples the hardware reports as dropped before this packet.
    pub missed: u64,
    /// Opaque bytes for [`DevicePort::decode_packet`].
    pub payload: Vec<u8>,
}

/// Capabilities the controller needs from a streaming device.
///
/// Only one actor uses the device at a time: the collection thread between
/// `configure_stream` and `stop_stream`, the consumer while decoding a drained
/// buffer.
pub trait DevicePort: Send + 'static {
    fn configure_stream(&mut self, channels: &[ChannelId], rate: u32) -> Result<()>;

    fn start_stream(&mut self) -> Result<()>;

    /// Next packet, or `Ok(None)` when the device's per-call timeout expired
    /// without data. Must not block indefinitely.
    fn next_packet(&mut self) -> Result<Option<RawPacket>>;

    /// Best-effort teardown. Callers log failures and carry on.
    fn stop_stream(&mut self) -> Result<()>;

    fn decode_packet(&self, packet: &RawPacket) -> ChannelSamples;
}

// ============================================================================
// Simulated device
// ============================================================================

const SQUARE_WAVE_HZ: f64 = 125.0;
const SQUARE_WAVE_AMPLITUDE: f64 = 1.0;
const SINE_BASE_HZ: f64 = 10.0;
const SINE_AMPLITUDE: f64 = 0.5;
const DEFAULT_SAMPLES_PER_PACKET: usize = 25;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5);

/// Step of a scripted packet sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Packet { samples: usize, missed: u64 },
    /// `next_packet` returns `Ok(None)` once.
    Timeout,
    /// `next_packet` fails with a stream error.
    Fail(String),
}

/// How `next_packet` paces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Return immediately.
    Immediate,
    /// Sleep this long before every packet.
    Fixed(Duration),
    /// Sleep the wall-clock time the packet's samples represent.
    Realtime,
}

/// Device call observed by a [`SimulatedDevice`], for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Configure { channels: Vec<ChannelId>, rate: u32 },
    Start,
    Stop,
}

/// Shared record of device calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<DeviceCall>>>);

impl CallLog {
    fn push(&self, call: DeviceCall) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

/// Hardware-free device producing a 125 Hz square wave on the first channel
/// and slow sines on the rest.
///
/// Without a script it streams forever. With a script it plays the steps in
/// order and then times out on every call.
///
/// Payload layout: one byte holding the position (within the configured
/// channel list) of the first sample, then little-endian `f32` samples in
/// stream order.
pub struct SimulatedDevice {
    channels: Vec<ChannelId>,
    rate: u32,
    streaming: bool,
    cursor: u64,
    samples_per_packet: usize,
    pacing: Pacing,
    idle_timeout: Duration,
    script: Option<VecDeque<ScriptStep>>,
    fail_configure: Option<String>,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    fail_connects: usize,
    calls: CallLog,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            rate: 0,
            streaming: false,
            cursor: 0,
            samples_per_packet: DEFAULT_SAMPLES_PER_PACKET,
            pacing: Pacing::Immediate,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            script: None,
            fail_configure: None,
            fail_start: None,
            fail_stop: None,
            fail_connects: 0,
            calls: CallLog::default(),
        }
    }
}

impl SimulatedDevice {
    /// Endless synthetic stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plays `steps`, then reports timeouts.
    pub fn scripted(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Some(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Script of `count` clean packets of `samples` each.
    pub fn packets(count: usize, samples: usize) -> Self {
        Self::scripted((0..count).map(|_| ScriptStep::Packet { samples, missed: 0 }))
    }

    pub fn with_samples_per_packet(mut self, samples: usize) -> Self {
        self.samples_per_packet = samples.max(1);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Delay of a timed-out `next_packet` call.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn failing_configure(mut self, reason: impl Into<String>) -> Self {
        self.fail_configure = Some(reason.into());
        self
    }

    pub fn failing_start(mut self, reason: impl Into<String>) -> Self {
        self.fail_start = Some(reason.into());
        self
    }

    pub fn failing_stop(mut self, reason: impl Into<String>) -> Self {
        self.fail_stop = Some(reason.into());
        self
    }

    /// Handle to the calls this device will observe.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    /// The first `times` connection attempts fail.
    pub fn failing_connect(mut self, times: usize) -> Self {
        self.fail_connects = times;
        self
    }

    /// Connector that hands this device out once connected.
    pub fn into_connector(self) -> Connector<Self> {
        connect_with(self, Self::connect)
    }

    fn connect(&mut self) -> Result<()> {
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(DeviceError::Connect("simulated device not responding".into()));
        }
        Ok(())
    }

    fn sample_value(&self, index: u64) -> f64 {
        let n = self.channels.len().max(1) as u64;
        let position = index % n;
        let t = (index / n) as f64 / f64::from(self.rate.max(1));
        if position == 0 {
            if (t * SQUARE_WAVE_HZ).fract() < 0.5 {
                SQUARE_WAVE_AMPLITUDE
            } else {
                -SQUARE_WAVE_AMPLITUDE
            }
        } else {
            SINE_AMPLITUDE * (2.0 * PI * SINE_BASE_HZ * position as f64 * t).sin()
        }
    }

    fn build_packet(&mut self, samples: usize, missed: u64) -> RawPacket {
        let n = self.channels.len().max(1) as u64;
        // Dropped samples still advance the stream position.
        self.cursor += missed;
        let mut payload = Vec::with_capacity(1 + samples * 4);
        payload.push((self.cursor % n) as u8);
        for i in 0..samples as u64 {
            let value = self.sample_value(self.cursor + i) as f32;
            payload.extend_from_slice(&value.to_le_bytes());
        }
        self.cursor += samples as u64;
        RawPacket {
            num_samples: samples,
            missed,
            payload,
        }
    }

    fn pace(&self, samples: usize) {
        let delay = match self.pacing {
            Pacing::Immediate => return,
            Pacing::Fixed(d) => d,
            Pacing::Realtime => {
                let aggregate = f64::from(self.rate) * self.channels.len() as f64;
                if aggregate <= 0.0 {
                    return;
                }
                Duration::from_secs_f64(samples as f64 / aggregate)
            }
        };
        thread::sleep(delay);
    }
}

impl DevicePort for SimulatedDevice {
    fn configure_stream(&mut self, channels: &[ChannelId], rate: u32) -> Result<()> {
        self.calls.push(DeviceCall::Configure {
            channels: channels.to_vec(),
            rate,
        });
        if let Some(reason) = &self.fail_configure {
            return Err(DeviceError::Configure(reason.clone()));
        }
        self.channels = channels.to_vec();
        self.rate = rate;
        self.cursor = 0;
        debug!("simulated stream configured: channels={:?}, rate={}", channels, rate);
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.calls.push(DeviceCall::Start);
        if let Some(reason) = &self.fail_start {
            return Err(DeviceError::Stream(reason.clone()));
        }
        if self.channels.is_empty() {
            return Err(DeviceError::Stream("stream not configured".into()));
        }
        self.streaming = true;
        Ok(())
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        if !self.streaming {
            return Err(DeviceError::Stream("stream not started".into()));
        }
        let step = match self.script.as_mut() {
            None => ScriptStep::Packet {
                samples: self.samples_per_packet,
                missed: 0,
            },
            Some(script) => script.pop_front().unwrap_or(ScriptStep::Timeout),
        };
        match step {
            ScriptStep::Packet { samples, missed } => {
                self.pace(samples);
                Ok(Some(self.build_packet(samples, missed)))
            }
            ScriptStep::Timeout => {
                thread::sleep(self.idle_timeout);
                Ok(None)
            }
            ScriptStep::Fail(reason) => Err(DeviceError::Stream(reason)),
        }
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.calls.push(DeviceCall::Stop);
        self.streaming = false;
        match &self.fail_stop {
            Some(reason) => Err(DeviceError::Stream(reason.clone())),
            None => Ok(()),
        }
    }

    fn decode_packet(&self, packet: &RawPacket) -> ChannelSamples {
        let mut out = ChannelSamples::new();
        let Some((&start, body)) = packet.payload.split_first() else {
            return out;
        };
        if self.channels.is_empty() {
            return out;
        }
        let n = self.channels.len();
        for (i, chunk) in body.chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let channel = self.channels[(start as usize + i) % n];
            out.entry(channel).or_default().push(f64::from(value));
        }
        out
    }
}
