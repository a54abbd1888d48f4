use anyhow::Result;
use config_manager::SystemConfig;
use job_orchestrator::BatchRunner;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional config path argument, otherwise the default search order
    let config = match std::env::args().nth(1) {
        Some(path) => SystemConfig::load_from_path(&path)?,
        None => SystemConfig::load()?,
    };

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.system.log_level)),
        )
        .init();

    info!("Starting tax tracker batch run...");
    info!(
        "Tracking {} chain(s), reports go to {}",
        config.chains.iter().filter(|c| c.enabled).count(),
        config.system.output_dir
    );

    let runner = BatchRunner::new(config)?;
    let summary = runner.run().await?;

    info!(
        "💰 Total proceeds ${}, cost basis ${}, profit ${}",
        summary.tax.total_proceeds_usd, summary.tax.total_cost_basis_usd, summary.tax.total_profit_usd
    );
    if summary.failed_passes() > 0 {
        warn!(
            "⚠️ {} of {} passes failed, rerun after fixing the errors above",
            summary.failed_passes(),
            summary.passes.len()
        );
    }

    Ok(())
}
