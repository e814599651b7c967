//! axiom daemon — supervises interactive AI coding agents over a stdio
//! tool protocol.

use anyhow::Result;
use tracing::info;

use ax_core::config::Settings;
use ax_daemon::daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Settings path: first CLI arg, else ~/.axiom/settings.json, else
    // compiled defaults.
    let settings_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load_from(&settings_path).unwrap_or_else(|e| {
        eprintln!("failed to load settings from {}: {e}; using defaults", settings_path.display());
        Settings::default()
    });

    ax_telemetry::logging::init_logging("ax-daemon", &settings.logging.level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        settings = %settings_path.display(),
        "axiom daemon starting"
    );

    Daemon::build(settings).run().await
}
