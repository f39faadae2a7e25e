//! Wires the components together and carries the operational surface used by
//! the management layer: status, start/stop and cache controls.

use crate::aet::AeDirectory;
use crate::cache::{CacheStats, InstanceCache};
use crate::config::AppConfig;
use crate::metadata::{MetadataCache, MetadataService};
use crate::mhd::{ManifestSource, MhdClient};
use crate::scp::{ScpContext, ScpEngine, ScpError};
use crate::types::AE;
use crate::wado::WadoClient;
use std::sync::Arc;
use std::time::Duration;

/// Read timeout for WADO-RS instance downloads.
const WADO_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GatewayStatus {
	pub running: bool,
	pub aet: AE,
	pub port: u16,
	pub mhd_fhir_base_url: String,
	pub wado_rs_base_url: String,
	pub metadata_entries: usize,
	pub instance_cache: CacheStats,
}

pub struct Gateway {
	config: AppConfig,
	engine: ScpEngine,
	metadata_cache: Arc<MetadataCache>,
	instance_cache: Arc<InstanceCache>,
}

impl Gateway {
	/// # Errors
	/// Fails when the upstream HTTP clients cannot be constructed.
	pub fn new(config: AppConfig) -> anyhow::Result<Self> {
		let mhd: Arc<dyn ManifestSource> = Arc::new(MhdClient::new(&config.upstream)?);
		let metadata_cache = Arc::new(MetadataCache::new(
			Arc::clone(&mhd),
			config.metadata.ttl(),
		));
		let metadata = Arc::new(MetadataService::new(mhd, Arc::clone(&metadata_cache)));
		let instance_cache = Arc::new(InstanceCache::new(&config.cache));
		let wado = Arc::new(WadoClient::new(WADO_READ_TIMEOUT)?);
		let ae_directory = Arc::new(AeDirectory::new(
			&config.aet_directory,
			config.aet_fallback.as_ref(),
		));

		let context = Arc::new(ScpContext {
			aet: config.scp.aet.clone(),
			max_pdu_length: config.scp.max_pdu_length,
			connect_timeout: Duration::from_millis(config.scp.connection_timeout),
			retrieve: config.retrieve,
			wado_rs_base_url: config.upstream.wado_rs_base_url.clone(),
			metadata,
			instance_cache: Arc::clone(&instance_cache),
			wado,
			ae_directory,
		});
		let engine = ScpEngine::new(config.scp.clone(), context);

		Ok(Self {
			config,
			engine,
			metadata_cache,
			instance_cache,
		})
	}

	pub const fn config(&self) -> &AppConfig {
		&self.config
	}

	/// # Errors
	/// See [`ScpEngine::start`].
	pub async fn start(&self) -> Result<(), ScpError> {
		self.engine.start().await
	}

	pub fn stop(&self) {
		self.engine.stop();
	}

	pub fn status(&self) -> GatewayStatus {
		GatewayStatus {
			running: self.engine.is_running(),
			aet: self.config.scp.aet.clone(),
			port: self.config.scp.port,
			mhd_fhir_base_url: self.config.upstream.mhd_fhir_base_url.clone(),
			wado_rs_base_url: self.config.upstream.wado_rs_base_url.clone(),
			metadata_entries: self.metadata_cache.len(),
			instance_cache: self.instance_cache.stats(),
		}
	}

	pub fn clear_metadata_cache(&self) {
		self.metadata_cache.clear();
	}

	pub fn clear_instance_cache(&self) {
		self.instance_cache.clear();
	}

	pub fn instance_cache_stats(&self) -> CacheStats {
		self.instance_cache.stats()
	}

	/// Applies new instance cache limits at runtime.
	pub fn configure_instance_cache(&self, max_size_mb: u64, ttl_minutes: u64, enabled: bool) {
		self.instance_cache
			.configure(max_size_mb, ttl_minutes, enabled);
	}
}
