mod core;
mod utils;
mod workers;

use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // Initialize the global data directory (must happen before any persistence access)
    let data_dir = crate::utils::data_dir::init(args.data_dir.as_deref());

    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match args.verbose {
            0 => "warn,peershare=info",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });

    // File logging layer - saves full logs under the data directory
    let log_path = data_dir.join("logs").join("peershare.log");
    let file_layer = FileLogLayer::new(&log_path)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    workers::cli::run(args, sos).await
}
