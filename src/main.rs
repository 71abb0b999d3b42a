use eyre::WrapErr;
use ogs_mount::collab::{NoCamera, NoGuider, NoTarget};
use ogs_mount::metrics::{LogSink, MetricsSink, UdpLineSink};
use ogs_mount::{drive, Config, Mount};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ogs-mount.toml".to_string());
    let config: Config =
        confy::load_path(&config_path).wrap_err_with(|| format!("loading {config_path}"))?;
    config.validate()?;

    let drives = drive::discover(&config.serial).wrap_err("binding axes to serial ports")?;

    let metrics: Arc<dyn MetricsSink> = match &config.metrics.address {
        Some(address) => {
            Arc::new(UdpLineSink::new(address).wrap_err("opening metrics socket")?)
        }
        None => Arc::new(LogSink),
    };

    // Stand-ins until the ephemeris and guider services are linked in; the
    // control loops treat them like any other collaborator.
    let mut mount = Mount::new(
        drives,
        &config,
        Arc::new(NoTarget),
        Arc::new(NoGuider),
        Arc::new(NoCamera),
        metrics,
    )?;
    info!("mount ready");

    wait_for_shutdown()?;
    info!("shutting down");
    mount.stop();
    Ok(())
}

fn wait_for_shutdown() -> eyre::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    let handler = SigHandler::Handler(handle_signal);
    // The handler only stores a flag, which is async-signal-safe.
    unsafe {
        signal(Signal::SIGINT, handler).wrap_err("installing SIGINT handler")?;
        signal(Signal::SIGTERM, handler).wrap_err("installing SIGTERM handler")?;
    }
    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}
