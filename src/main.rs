use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use daqstream::logging::init_logging;
use daqstream::{
    AcquisitionController, Capture, CaptureStore, Configuration, Pacing, RunState, Scaling,
    SimulatedDevice, Window, DEFAULT_POLL_TIMEOUT,
};

#[derive(Parser, Debug)]
#[command(
    name = "daqstream-demo",
    about = "Acquire integration windows from a simulated streaming DAQ"
)]
struct Args {
    /// Analog inputs to acquire (comma separated, e.g. 0,2)
    #[arg(long, value_delimiter = ',', default_value = "0")]
    channels: Vec<u8>,
    /// Samples per second per channel
    #[arg(long, default_value_t = daqstream::DEFAULT_SAMPLE_RATE)]
    rate: u32,
    /// Integration window in seconds
    #[arg(long, default_value_t = daqstream::DEFAULT_INTEGRATION_SECS)]
    integration: f64,
    /// Number of windows to collect before exiting
    #[arg(long, default_value_t = 3)]
    windows: usize,
    /// Re-request automatically after every window
    #[arg(long)]
    continuous: bool,
    /// Save every window into this folder
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Scaling prefactor stored with saved windows
    #[arg(long, default_value_t = 1.0)]
    prefactor: f64,
    /// Unit stored with saved windows
    #[arg(long, default_value = "V")]
    unit: String,
    /// Deliver simulated packets as fast as possible instead of in real time
    #[arg(long)]
    fast: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = Configuration::new(args.channels.iter().copied(), args.rate, args.integration)
        .context("invalid acquisition settings")?;
    println!(
        "Channels: {:?} | Rate: {} S/s | Integration: {:.2} s | Target: {} samples",
        config.channels().iter().map(ToString::to_string).collect::<Vec<_>>(),
        config.rate(),
        config.integration_secs(),
        config.integration_target()
    );

    let pacing = if args.fast {
        Pacing::Immediate
    } else {
        Pacing::Realtime
    };
    let device = SimulatedDevice::new().with_pacing(pacing);
    let mut ctl = AcquisitionController::new(device.into_connector());
    ctl.configure(config.clone())?;
    ctl.set_continuous(args.continuous);

    let mut store = CaptureStore::new();
    if let Some(dir) = &args.save_dir {
        store
            .set_save_all(dir)
            .with_context(|| format!("cannot use {} for captures", dir.display()))?;
    }
    let scaling = Scaling {
        prefactor: args.prefactor,
        unit: args.unit.clone(),
    };

    ctl.start()
        .with_context(|| format!("start failed ({})", ctl.status()))?;

    let budget = window_budget(&config, args.windows);
    let deadline = Instant::now().checked_add(budget);
    let mut received = 0usize;

    while received < args.windows {
        if deadline.is_some_and(|d| Instant::now() > d) {
            ctl.stop();
            bail!("timed out after {:?} waiting for windows", budget);
        }
        let Some(window) = ctl.poll(DEFAULT_POLL_TIMEOUT) else {
            if let RunState::Aborted(reason) = ctl.state() {
                bail!("acquisition aborted: {reason}");
            }
            continue;
        };
        received += 1;
        print_window(received, &window, &ctl.status());

        let capture = Capture::new(window).with_scaling(scaling.clone());
        if let Some(path) = store.save_continuous(&capture)? {
            println!("  saved {} ({})", path.display(), store.status());
        }

        if !args.continuous && received < args.windows {
            ctl.start()
                .with_context(|| format!("re-request failed ({})", ctl.status()))?;
        }
    }

    println!("Stopping...");
    ctl.stop();
    println!("Done. Status: {}", ctl.status());
    Ok(())
}

/// Three integration times per window plus slack; `Duration::MAX` if that
/// overflows.
fn window_budget(config: &Configuration, windows: usize) -> Duration {
    let secs = config.integration_secs() * 3.0 * windows as f64;
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::MAX)
        .saturating_add(Duration::from_secs(5))
}

fn print_window(index: usize, window: &Window, status: &str) {
    let lengths: Vec<String> = window
        .channels
        .iter()
        .map(|(id, samples)| format!("{id}={}", samples.len()))
        .collect();
    println!(
        "[Window {}] {:.3} s | {} | {} | {}",
        index,
        window.duration().as_secs_f64(),
        lengths.join(" "),
        window.dropped_summary(),
        status
    );
}
