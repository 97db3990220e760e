//! Python bindings.
//!
//! The device side is supplied from Python, so any driver with a Python API
//! (LabJackPython's `u6.U6`, a test double, ...) can be wrapped in a small
//! adapter object and driven by the Rust controller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::warn;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::config::{ChannelId, DEFAULT_SAMPLE_RATE, MAX_AGGREGATE_RATE};
use crate::controller::{AcquisitionController, Monitor};
use crate::device::{connect_with, ChannelSamples, Connector, DevicePort, RawPacket};
use crate::errors::{DeviceError, Result};
use crate::handshake::RunState;
use crate::window::Window;

// ============================================================================
// Python-implemented device port
// ============================================================================

/// Adapter around a Python object exposing:
///
/// - `connect()` (optional)
/// - `configure_stream(channels: list[int], rate: int)`
/// - `start_stream()`
/// - `next_packet() -> None | tuple[int, int, bytes]` as `(num_samples, missed, payload)`
/// - `stop_stream()`
/// - `decode_packet(payload: bytes) -> dict[str, list[float]]` keyed `"AIN<n>"`
struct PyDevicePort {
    obj: Py<PyAny>,
}

fn stream_err(e: PyErr) -> DeviceError {
    DeviceError::Stream(e.to_string())
}

impl PyDevicePort {
    fn call0(&self, method: &str) -> std::result::Result<(), PyErr> {
        Python::attach(|py| self.obj.bind(py).call_method0(method).map(|_| ()))
    }
}

impl DevicePort for PyDevicePort {
    fn configure_stream(&mut self, channels: &[ChannelId], rate: u32) -> Result<()> {
        let indices: Vec<u8> = channels.iter().map(|c| c.index()).collect();
        Python::attach(|py| {
            self.obj
                .bind(py)
                .call_method1("configure_stream", (indices, rate))
                .map(|_| ())
                .map_err(|e| DeviceError::Configure(e.to_string()))
        })
    }

    fn start_stream(&mut self) -> Result<()> {
        self.call0("start_stream").map_err(stream_err)
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        Python::attach(|py| {
            let result = self
                .obj
                .bind(py)
                .call_method0("next_packet")
                .map_err(stream_err)?;
            if result.is_none() {
                return Ok(None);
            }
            let (num_samples, missed, payload) = result
                .extract::<(usize, u64, Vec<u8>)>()
                .map_err(|e| stream_err(e.into()))?;
            Ok(Some(RawPacket {
                num_samples,
                missed,
                payload,
            }))
        })
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.call0("stop_stream").map_err(stream_err)
    }

    fn decode_packet(&self, packet: &RawPacket) -> ChannelSamples {
        Python::attach(|py| {
            let payload = PyBytes::new(py, &packet.payload);
            let decoded = self
                .obj
                .bind(py)
                .call_method1("decode_packet", (payload,))
                .and_then(|r| {
                    r.extract::<HashMap<String, Vec<f64>>>()
                        .map_err(Into::into)
                });
            let decoded = match decoded {
                Ok(d) => d,
                Err(e) => {
                    warn!("decode_packet raised: {}", e);
                    return ChannelSamples::new();
                }
            };
            let mut out = ChannelSamples::new();
            for (label, samples) in decoded {
                match label.parse::<ChannelId>() {
                    Ok(id) => {
                        out.insert(id, samples);
                    }
                    Err(e) => warn!("decode_packet: {}", e),
                }
            }
            out
        })
    }
}

fn py_connector(device: Py<PyAny>) -> Connector<PyDevicePort> {
    connect_with(PyDevicePort { obj: device }, |port| {
        Python::attach(|py| {
            let bound = port.obj.bind(py);
            if bound.hasattr("connect")? {
                bound.call_method0("connect")?;
            }
            Ok::<_, PyErr>(())
        })
        .map_err(|e| DeviceError::Connect(e.to_string()))
    })
}

// ============================================================================
// Controller
// ============================================================================

fn window_to_dict<'py>(py: Python<'py>, window: &Window) -> PyResult<Bound<'py, PyDict>> {
    let channels = PyDict::new(py);
    for (id, samples) in &window.channels {
        channels.set_item(id.to_string(), samples.clone())?;
    }
    let dict = PyDict::new(py);
    dict.set_item("rate", window.rate)?;
    dict.set_item("points", window.points())?;
    dict.set_item("dropped", window.dropped)?;
    dict.set_item("channels", channels)?;
    Ok(dict)
}

fn state_name(state: &RunState) -> &'static str {
    match state {
        RunState::Idle => "idle",
        RunState::AwaitingRequest => "awaiting_request",
        RunState::Streaming => "streaming",
        RunState::Draining => "draining",
        RunState::Stopped => "stopped",
        RunState::Aborted(_) => "aborted",
    }
}

/// Windowed acquisition controller driving a Python device adapter.
///
/// Args:
///     device: Object implementing the device adapter methods (see module docs).
#[pyclass(name = "Controller", frozen)]
struct PyController {
    inner: Mutex<AcquisitionController<PyDevicePort>>,
    monitor: Monitor<PyDevicePort>,
}

impl PyController {
    fn lock(&self) -> MutexGuard<'_, AcquisitionController<PyDevicePort>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PyController {
    fn drop(&mut self) {
        // The acquisition thread needs the GIL to reach the device; release it
        // while waiting for the thread to exit.
        Python::attach(|py| py.detach(|| self.lock().stop()));
    }
}

#[pymethods]
impl PyController {
    #[new]
    fn new(device: Py<PyAny>) -> Self {
        let controller = AcquisitionController::new(py_connector(device));
        let monitor = controller.monitor();
        PyController {
            inner: Mutex::new(controller),
            monitor,
        }
    }

    /// Set channels and optionally rate / integration time (seconds).
    ///
    /// Raises:
    ///     ValueError: If the configuration is rejected (empty channel set,
    ///         rate × channels above the device ceiling, ...).
    #[pyo3(signature = (channels, rate=None, integration=None))]
    fn configure(
        &self,
        py: Python<'_>,
        channels: Vec<u8>,
        rate: Option<u32>,
        integration: Option<f64>,
    ) -> PyResult<()> {
        py.detach(|| {
            let mut ctl = self.lock();
            let config = ctl
                .configuration()
                .with_channels(channels)
                .and_then(|c| c.with_sampling(rate, integration))?;
            ctl.configure(config)
        })
        .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    /// Request a window, spawning the acquisition thread if needed.
    ///
    /// Returns:
    ///     False if acquisition could not start (see `status()`).
    #[pyo3(signature = (continuous=false))]
    fn start(&self, py: Python<'_>, continuous: bool) -> bool {
        py.detach(|| {
            let mut ctl = self.lock();
            ctl.set_continuous(continuous);
            match ctl.start() {
                Ok(()) => true,
                Err(e) => {
                    warn!("start failed: {}", e);
                    false
                }
            }
        })
    }

    fn stop(&self, py: Python<'_>) {
        py.detach(|| self.lock().stop());
    }

    /// Wait up to `timeout` seconds for a window.
    ///
    /// Returns:
    ///     None, or a dict with keys rate, points, dropped, channels.
    #[pyo3(signature = (timeout=0.05))]
    fn poll<'py>(&self, py: Python<'py>, timeout: f64) -> PyResult<Option<Bound<'py, PyDict>>> {
        let timeout = Duration::try_from_secs_f64(timeout)
            .map_err(|e| PyValueError::new_err(format!("invalid timeout: {e}")))?;
        let window = py.detach(|| self.lock().poll(timeout));
        window.map(|w| window_to_dict(py, &w)).transpose()
    }

    fn status(&self) -> String {
        self.monitor.status()
    }

    fn state(&self) -> &'static str {
        state_name(&self.monitor.state())
    }

    /// Error message of an aborted run, if any.
    fn abort_reason(&self) -> Option<String> {
        match self.monitor.state() {
            RunState::Aborted(reason) => Some(reason),
            _ => None,
        }
    }

    #[getter]
    fn is_running(&self, py: Python<'_>) -> bool {
        py.detach(|| self.lock().is_running())
    }

    fn __repr__(&self) -> String {
        format!("Controller(state={})", state_name(&self.monitor.state()))
    }
}

/// Route Rust log output to stderr (level from DAQSTREAM_LOG / RUST_LOG).
#[pyfunction(name = "init_logging")]
fn py_init_logging() {
    crate::logging::init_logging();
}

#[pymodule]
fn daqstream(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyController>()?;
    m.add_function(wrap_pyfunction!(py_init_logging, m)?)?;
    m.add("MAX_AGGREGATE_RATE", MAX_AGGREGATE_RATE)?;
    m.add("DEFAULT_SAMPLE_RATE", DEFAULT_SAMPLE_RATE)?;
    Ok(())
}
