//! Acquisition controller: owns the collection thread and its handshake.
//!
//! # Cycle
//!
//! ```text
//! Idle --start--> AwaitingRequest --request--> Streaming
//!   Streaming --target reached / stop--> Draining
//!   Draining --no stop--> AwaitingRequest (data-ready raised)
//!   Draining --stop--> Stopped
//!   Streaming --device error--> Aborted (data-ready raised)
//!   Stopped/Aborted --start--> AwaitingRequest (fresh thread)
//! ```
//!
//! One thread per controller, reused across cycles. The consumer polls with
//! [`AcquisitionController::poll`] from whatever loop it runs (typically a UI
//! timer); that call never blocks past its timeout.
//!
//! # Cancellation
//!
//! Stopping is cooperative. The thread looks at stop-requested before each
//! cycle and once per packet, and relies on the device's per-call timeout to
//! come back around. [`AcquisitionController::stop`] waits at most
//! `2 × integration time`; if the thread has not exited by then the status
//! reads `Acquisition thread timed out`, the thread is left to finish on its
//! own and `stop` may be called again.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::buffer::PacketBuffer;
use crate::config::{ChannelId, Configuration};
use crate::decoder;
use crate::device::{Connector, DevicePort};
use crate::errors::{ConfigError, DeviceError, StartError};
use crate::handshake::{Handshake, RunState, Wake};
use crate::window::Window;

/// Poll timeout suited to a ~10 Hz UI refresh.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

const DEFAULT_REQUEST_POLL: Duration = Duration::from_millis(10);
const DEFAULT_STOP_WAIT_FACTOR: f64 = 2.0;
const THREAD_NAME: &str = "daqstream-acquire";

const STATUS_NO_HARDWARE: &str = "No hardware connected.";
const STATUS_NO_CHANNELS: &str = "No channels selected.";
const STATUS_WAITING: &str = "Waiting";
const STATUS_STREAMING: &str = "Streaming";
const STATUS_NO_DATA: &str = "Error: no data";
const STATUS_STOPPED: &str = "Stopped.";
const STATUS_TIMED_OUT: &str = "Acquisition thread timed out";

/// Controller tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerOptions {
    /// How often an idle thread re-checks for a request (and refreshes the
    /// `Waiting` status).
    pub request_poll: Duration,
    /// `stop` waits this many integration times for the thread to exit.
    pub stop_wait_factor: f64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            request_poll: DEFAULT_REQUEST_POLL,
            stop_wait_factor: DEFAULT_STOP_WAIT_FACTOR,
        }
    }
}

/// State shared with the collection thread.
struct Shared<D> {
    handshake: Handshake,
    buffer: PacketBuffer,
    config: Mutex<Configuration>,
    status: Mutex<String>,
    device: OnceLock<Mutex<D>>,
}

impl<D> Shared<D> {
    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.into();
    }

    fn status(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn config(&self) -> Configuration {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn lock_device<D>(device: &Mutex<D>) -> MutexGuard<'_, D> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one streaming device through windowed acquisition.
///
/// # Example
/// ```ignore
/// let mut ctl = AcquisitionController::new(SimulatedDevice::new().into_connector());
/// ctl.configure(Configuration::new([0u8, 2], 5000, 2.0)?)?;
/// ctl.start()?;
/// loop {
///     if let Some(window) = ctl.poll(DEFAULT_POLL_TIMEOUT) {
///         println!("{}", window.dropped_summary());
///     }
/// }
/// ```
pub struct AcquisitionController<D: DevicePort> {
    shared: Arc<Shared<D>>,
    connector: Connector<D>,
    worker: Option<JoinHandle<()>>,
    options: ControllerOptions,
    continuous: bool,
}

impl<D: DevicePort> AcquisitionController<D> {
    pub fn new(connector: Connector<D>) -> Self {
        Self::with_options(connector, ControllerOptions::default())
    }

    pub fn with_options(connector: Connector<D>, options: ControllerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                handshake: Handshake::new(),
                buffer: PacketBuffer::new(),
                config: Mutex::new(Configuration::default()),
                status: Mutex::new(String::new()),
                device: OnceLock::new(),
            }),
            connector,
            worker: None,
            options,
            continuous: false,
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn configuration(&self) -> Configuration {
        self.shared.config()
    }

    /// Applies a new configuration. A running acquisition is stopped first and
    /// restarted under the new settings; an in-flight window is never merged
    /// with samples taken under a different configuration.
    pub fn configure(&mut self, config: Configuration) -> Result<(), ConfigError> {
        config.validate()?;
        let restart = self.is_running();
        if restart {
            debug!("reconfiguring while running; restarting acquisition");
            self.stop();
        }
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config;
        if restart {
            if let Err(e) = self.start() {
                warn!("restart after reconfiguration failed: {}", e);
            }
        }
        Ok(())
    }

    pub fn set_channels<I, C>(&mut self, channels: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelId>,
    {
        let config = self.configuration().with_channels(channels)?;
        self.configure(config)
    }

    /// Changes rate and/or integration time; `None` keeps the current value.
    pub fn set_sampling(
        &mut self,
        rate: Option<u32>,
        integration_secs: Option<f64>,
    ) -> Result<(), ConfigError> {
        let config = self.configuration().with_sampling(rate, integration_secs)?;
        self.configure(config)
    }

    /// When set, every window returned by [`poll`](Self::poll) immediately
    /// requests the next one.
    pub fn set_continuous(&mut self, continuous: bool) {
        self.continuous = continuous;
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// True while the collection thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Requests one window. Connects on first use and spawns the collection
    /// thread if none is alive; otherwise just raises request-active.
    pub fn start(&mut self) -> Result<(), StartError> {
        self.ensure_connected()?;

        let config = self.configuration();
        if let Err(e) = config.validate() {
            self.shared.set_status(match &e {
                ConfigError::EmptyChannels => STATUS_NO_CHANNELS.to_string(),
                ConfigError::AggregateRateExceeded { channels, .. } => {
                    format!("Sample rate too high for {channels} channels.")
                }
                other => format!("Error: {other}"),
            });
            return Err(e.into());
        }

        let alive = self.is_running() && !self.shared.handshake.state().is_terminal();
        if alive {
            if self.shared.handshake.is_stop() {
                self.shared.set_status(STATUS_TIMED_OUT);
                return Err(StartError::PreviousRunPending);
            }
        } else {
            self.reap_worker();
            self.shared.handshake.rearm();
            let shared = Arc::clone(&self.shared);
            let request_poll = self.options.request_poll;
            let handle = thread::Builder::new()
                .name(THREAD_NAME.into())
                .spawn(move || acquire_loop(shared, request_poll))
                .map_err(StartError::Spawn)?;
            self.worker = Some(handle);
        }
        self.shared.handshake.request_window();
        Ok(())
    }

    /// Stops acquisition and waits (bounded) for the thread to exit.
    /// No-op when nothing was started.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        self.shared.handshake.clear_request();
        self.shared.handshake.raise_stop();

        let wait = self.stop_wait();
        if self.shared.handshake.wait_terminal(wait) {
            self.reap_worker();
        } else {
            warn!("acquisition thread still running {:?} after stop request", wait);
            self.shared.set_status(STATUS_TIMED_OUT);
        }
    }

    /// `stop_wait_factor × integration time`, falling back to one integration
    /// time when the product is not a representable duration.
    fn stop_wait(&self) -> Duration {
        let integration = self.configuration().integration_time();
        Duration::try_from_secs_f64(integration.as_secs_f64() * self.options.stop_wait_factor)
            .unwrap_or(integration)
    }

    fn ensure_connected(&mut self) -> Result<(), StartError> {
        if self.shared.device.get().is_some() {
            return Ok(());
        }
        match (self.connector)() {
            Ok(device) => {
                info!("device connected");
                // Only this method sets the cell, and it holds `&mut self`.
                let _ = self.shared.device.set(Mutex::new(device));
                Ok(())
            }
            Err(e) => {
                warn!("device connect failed: {}", e);
                self.shared.set_status(STATUS_NO_HARDWARE);
                Err(StartError::NoDevice(e))
            }
        }
    }

    /// Joins a thread that has already exited.
    fn reap_worker(&mut self) {
        let finished = self.worker.as_ref().is_some_and(|h| h.is_finished())
            || self.shared.handshake.state().is_terminal();
        if !finished {
            return;
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------------

    /// Waits up to `timeout` for a completed window and decodes it. `None`
    /// means no window was ready, which is the normal outcome of most polls.
    pub fn fetch_window(&self, timeout: Duration) -> Option<Window> {
        if !self.shared.handshake.take_ready(timeout) {
            return None;
        }
        let drained = self.shared.buffer.drain()?;
        let device = self.shared.device.get()?;
        let window = decoder::decode(&drained.packets, drained.config.rate(), &*lock_device(device))?;
        if window.dropped > 0 {
            warn!("{}", window.dropped_summary());
        }
        Some(window)
    }

    /// [`fetch_window`](Self::fetch_window), then re-requests in continuous mode.
    pub fn poll(&mut self, timeout: Duration) -> Option<Window> {
        let window = self.fetch_window(timeout)?;
        if self.continuous {
            if let Err(e) = self.start() {
                warn!("continuous re-request failed: {}", e);
            }
        }
        Some(window)
    }

    /// Last status message. Never blocks on the collection thread.
    pub fn status(&self) -> String {
        self.shared.status()
    }

    pub fn state(&self) -> RunState {
        self.shared.handshake.state()
    }

    /// Read-only view of status and state that can outlive borrows of the
    /// controller, e.g. for a UI thread while another thread polls.
    pub fn monitor(&self) -> Monitor<D> {
        Monitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// See [`AcquisitionController::monitor`].
pub struct Monitor<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for Monitor<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D> Monitor<D> {
    pub fn status(&self) -> String {
        self.shared.status()
    }

    pub fn state(&self) -> RunState {
        self.shared.handshake.state()
    }
}

impl<D: DevicePort> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        self.stop();
        if let Some(device) = self.shared.device.get() {
            // A thread that ignored the stop may still hold the device.
            if let Ok(mut device) = device.try_lock() {
                if let Err(e) = device.stop_stream() {
                    debug!("stop_stream on drop failed: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// Collection thread
// ============================================================================

enum CycleOutcome {
    /// Integration target reached.
    Complete,
    /// Stop observed mid-stream.
    Stopped,
    /// Stream could not be configured; nothing was collected.
    Misconfigured(DeviceError),
    /// Device failed while streaming.
    Failed(DeviceError),
}

fn acquire_loop<D: DevicePort>(shared: Arc<Shared<D>>, request_poll: Duration) {
    let hs = &shared.handshake;
    let Some(device) = shared.device.get() else {
        shared.set_status(format!("Aborted: {}", DeviceError::NotConnected));
        hs.abort(DeviceError::NotConnected.to_string());
        return;
    };
    info!("acquisition thread started");

    // A previous session may have left the device streaming.
    if let Err(e) = lock_device(device).stop_stream() {
        debug!("initial stop_stream failed (ignored): {}", e);
    }

    let mut failure: Option<DeviceError> = None;
    loop {
        match hs.wait_request(request_poll) {
            Wake::Stop => break,
            Wake::Timeout => {
                shared.set_status(STATUS_WAITING);
                continue;
            }
            Wake::Request => {}
        }

        // Snapshot for the whole cycle; later reconfiguration goes through a restart.
        let config = shared.config();
        if !hs.begin_cycle() {
            break;
        }
        shared.buffer.reset(config.clone());
        info!(
            "cycle start: channels={:?}, rate={}, target={} samples",
            config.channels(),
            config.rate(),
            config.integration_target()
        );

        let outcome = {
            let mut dev = lock_device(device);
            let outcome = stream_cycle(&shared, &mut *dev, &config);
            hs.set_state(RunState::Draining);
            if !matches!(outcome, CycleOutcome::Misconfigured(_)) {
                if let Err(e) = dev.stop_stream() {
                    warn!("stop_stream failed during teardown: {}", e);
                }
            }
            outcome
        };

        match outcome {
            CycleOutcome::Complete | CycleOutcome::Stopped => {
                if hs.finish_cycle() {
                    debug!(
                        "window ready: packets={}, samples={}",
                        shared.buffer.len(),
                        shared.buffer.total_samples()
                    );
                } else {
                    debug!("stop requested; discarding {} buffered packets", shared.buffer.len());
                }
            }
            CycleOutcome::Misconfigured(e) => {
                warn!("stream configuration failed: {}", e);
                shared.set_status(format!("Error: {e}"));
                hs.clear_request();
                hs.set_state(RunState::AwaitingRequest);
            }
            CycleOutcome::Failed(e) => {
                error!("device error while streaming: {}", e);
                failure = Some(e);
                break;
            }
        }
    }

    match failure {
        None => {
            shared.set_status(STATUS_STOPPED);
            hs.set_state(RunState::Stopped);
            info!("acquisition thread stopped");
        }
        Some(e) => {
            shared.set_status(format!("Aborted: {e}"));
            hs.abort(e.to_string());
            info!("acquisition thread aborted");
        }
    }
}

fn stream_cycle<D: DevicePort>(shared: &Shared<D>, device: &mut D, config: &Configuration) -> CycleOutcome {
    if let Err(e) = device.configure_stream(config.channels(), config.rate()) {
        return CycleOutcome::Misconfigured(e);
    }
    if let Err(e) = device.start_stream() {
        return CycleOutcome::Failed(e);
    }
    shared.set_status(STATUS_STREAMING);

    let target = config.integration_target();
    let mut collected = 0u64;
    while collected < target {
        if shared.handshake.is_stop() {
            return CycleOutcome::Stopped;
        }
        match device.next_packet() {
            Ok(Some(packet)) => {
                collected += packet.num_samples as u64;
                shared.buffer.push(packet);
            }
            Ok(None) => shared.set_status(STATUS_NO_DATA),
            Err(e) => return CycleOutcome::Failed(e),
        }
    }
    CycleOutcome::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ScriptStep, SimulatedDevice};

    fn controller(device: SimulatedDevice) -> AcquisitionController<SimulatedDevice> {
        AcquisitionController::new(device.into_connector())
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let mut ctl = controller(SimulatedDevice::new());
        ctl.stop();
        assert_eq!(ctl.state(), RunState::Idle);
        assert_eq!(ctl.status(), "");
    }

    #[test]
    fn start_without_hardware_fails_fast() {
        let mut ctl: AcquisitionController<SimulatedDevice> =
            AcquisitionController::new(Box::new(|| Err(DeviceError::Connect("no usb".into()))));
        assert!(matches!(ctl.start(), Err(StartError::NoDevice(_))));
        assert_eq!(ctl.status(), STATUS_NO_HARDWARE);
        assert!(!ctl.is_running());
        assert_eq!(ctl.state(), RunState::Idle);
    }

    #[test]
    fn configure_rejects_before_touching_thread() {
        let mut ctl = controller(SimulatedDevice::new());
        let err = ctl.set_sampling(Some(30_000), None).and_then(|_| ctl.set_channels([0u8, 1]));
        assert!(matches!(err, Err(ConfigError::AggregateRateExceeded { .. })));
        assert!(!ctl.is_running());
        assert_eq!(ctl.configuration().channels(), &[ChannelId(0)]);
    }

    #[test]
    fn misconfigured_stream_reports_and_waits() {
        let device = SimulatedDevice::new().failing_configure("bad gain");
        // Long request poll so the idle "Waiting" refresh cannot overwrite the error.
        let options = ControllerOptions {
            request_poll: Duration::from_secs(10),
            ..ControllerOptions::default()
        };
        let mut ctl = AcquisitionController::with_options(device.into_connector(), options);
        ctl.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !ctl.status().starts_with("Error:") && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(ctl.status().contains("bad gain"), "{}", ctl.status());
        assert!(ctl.fetch_window(Duration::from_millis(20)).is_none());
        assert!(ctl.is_running());
        ctl.stop();
        assert_eq!(ctl.state(), RunState::Stopped);
    }

    #[test]
    fn start_failure_aborts_run() {
        let device = SimulatedDevice::scripted([ScriptStep::Timeout]).failing_start("no stream");
        let mut ctl = controller(device);
        ctl.start().unwrap();
        assert!(ctl.shared.handshake.wait_terminal(Duration::from_secs(2)));
        assert!(matches!(ctl.state(), RunState::Aborted(_)));
        assert!(ctl.status().starts_with("Aborted:"));
        // Nothing was buffered, so the published window is empty.
        assert!(ctl.fetch_window(Duration::from_millis(10)).is_none());
    }
}
