//! OneTox loopback entry point: moves a file between two transfer managers
//! wired back to back in one process.

mod app;
mod config;
mod loopback;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting OneTox loopback");

    let path = std::env::args_os().nth(1).map(Into::into);
    let config = config::LoopbackConfig::load(path)?;
    tracing::info!(
        downloads = %config.downloads_dir.display(),
        ledger = %config.ledger_path.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("loopback finished");
    Ok(())
}
