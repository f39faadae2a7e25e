use anyhow::Context;
use mado_gateway::config::AppConfig;
use mado_gateway::Gateway;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber).expect("set_global_default");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = AppConfig::new().context("Failed to load configuration")?;
	init_logger(config.telemetry.level);

	let auto_start = config.scp.auto_start;
	let gateway = Gateway::new(config)?;

	if auto_start {
		gateway.start().await?;
	} else {
		warn!("auto-start is disabled, the SCP must be started via the management surface");
	}

	let status = gateway.status();
	info!(
		aet = status.aet,
		port = status.port,
		mhd = status.mhd_fhir_base_url,
		wado = status.wado_rs_base_url,
		"Gateway initialized"
	);

	tokio::signal::ctrl_c()
		.await
		.context("Failed to listen for shutdown signal")?;
	info!("Shutting down");
	gateway.stop();

	Ok(())
}
