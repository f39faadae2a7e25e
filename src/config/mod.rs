use crate::types::AE;
use crate::DEFAULT_AET;

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub scp: ScpConfig,
	#[serde(default)]
	pub upstream: UpstreamConfig,
	#[serde(default)]
	pub retrieve: RetrieveConfig,
	#[serde(default)]
	pub cache: InstanceCacheConfig,
	#[serde(default)]
	pub metadata: MetadataConfig,
	#[serde(default)]
	pub aet_directory: Vec<AetEntryConfig>,
	#[serde(default)]
	pub aet_fallback: Option<AetFallbackConfig>,
}

impl AppConfig {
	/// Loads the application configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the same folder as the executable binary
	/// 3. From environment variables, prefixed with `MADO_GATEWAY`
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("MADO_GATEWAY").separator("_"))
			.build()?
			.try_deserialize()
	}
}

/// Configuration for the inbound DIMSE surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScpConfig {
	pub interface: IpAddr,
	#[serde(default = "ScpConfig::default_aet")]
	pub aet: AE,
	#[serde(default = "ScpConfig::default_port")]
	pub port: u16,
	#[serde(default = "ScpConfig::default_auto_start")]
	pub auto_start: bool,
	#[serde(default = "ScpConfig::default_max_pdu_length")]
	pub max_pdu_length: u32,
	/// TCP connect/accept timeout in milliseconds.
	#[serde(default = "ScpConfig::default_connection_timeout")]
	pub connection_timeout: u64,
	/// DIMSE read/write timeout on an established association in milliseconds.
	#[serde(default = "ScpConfig::default_association_timeout")]
	pub association_timeout: u64,
	/// Cap on concurrent inbound associations.
	#[serde(default = "ScpConfig::default_max_associations")]
	pub max_associations: usize,
}

impl ScpConfig {
	pub const fn default_port() -> u16 {
		11112
	}
	pub const fn default_auto_start() -> bool {
		true
	}
	pub const fn default_max_pdu_length() -> u32 {
		16_384
	}
	pub const fn default_connection_timeout() -> u64 {
		10_000
	}
	pub const fn default_association_timeout() -> u64 {
		30_000
	}
	pub const fn default_max_associations() -> usize {
		16
	}

	pub fn default_aet() -> AE {
		AE::from(DEFAULT_AET)
	}

	pub const fn association_timeout_duration(&self) -> Duration {
		Duration::from_millis(self.association_timeout)
	}
}

impl Default for ScpConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			aet: AE::from(DEFAULT_AET),
			port: Self::default_port(),
			auto_start: Self::default_auto_start(),
			max_pdu_length: Self::default_max_pdu_length(),
			connection_timeout: Self::default_connection_timeout(),
			association_timeout: Self::default_association_timeout(),
			max_associations: Self::default_max_associations(),
		}
	}
}

/// Base URLs of the HTTP services this gateway translates to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
	pub mhd_fhir_base_url: String,
	pub wado_rs_base_url: String,
}

impl Default for UpstreamConfig {
	fn default() -> Self {
		Self {
			mhd_fhir_base_url: String::from("http://localhost:8080/fhir"),
			wado_rs_base_url: String::from("http://localhost:8080/wado-rs"),
		}
	}
}

/// Pool sizes for the C-MOVE download/store pipeline.
/// Both bounds apply per `(series, SOP class)` bucket.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveConfig {
	#[serde(default = "RetrieveConfig::default_max_parallel_downloads")]
	pub max_parallel_downloads: usize,
	#[serde(default = "RetrieveConfig::default_max_parallel_stores")]
	pub max_parallel_stores: usize,
}

impl RetrieveConfig {
	pub const fn default_max_parallel_downloads() -> usize {
		4
	}
	pub const fn default_max_parallel_stores() -> usize {
		2
	}
}

impl Default for RetrieveConfig {
	fn default() -> Self {
		Self {
			max_parallel_downloads: Self::default_max_parallel_downloads(),
			max_parallel_stores: Self::default_max_parallel_stores(),
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceCacheConfig {
	#[serde(default = "InstanceCacheConfig::default_enabled")]
	pub enabled: bool,
	#[serde(default = "InstanceCacheConfig::default_max_size_mb")]
	pub max_size_mb: u64,
	#[serde(default = "InstanceCacheConfig::default_ttl_minutes")]
	pub ttl_minutes: u64,
}

impl InstanceCacheConfig {
	pub const fn default_enabled() -> bool {
		true
	}
	pub const fn default_max_size_mb() -> u64 {
		512
	}
	pub const fn default_ttl_minutes() -> u64 {
		10
	}
}

impl Default for InstanceCacheConfig {
	fn default() -> Self {
		Self {
			enabled: Self::default_enabled(),
			max_size_mb: Self::default_max_size_mb(),
			ttl_minutes: Self::default_ttl_minutes(),
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataConfig {
	#[serde(default = "MetadataConfig::default_ttl_minutes")]
	pub ttl_minutes: u64,
}

impl MetadataConfig {
	pub const fn default_ttl_minutes() -> u64 {
		5
	}

	pub const fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_minutes * 60)
	}
}

impl Default for MetadataConfig {
	fn default() -> Self {
		Self {
			ttl_minutes: Self::default_ttl_minutes(),
		}
	}
}

/// One known move destination on the DIMSE network.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AetEntryConfig {
	pub aet: AE,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub description: Option<String>,
}

/// Fallback host/port for move destinations missing from the directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AetFallbackConfig {
	pub host: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_deserialize() {
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.yaml"),
				config::FileFormat::Yaml,
			))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(config.scp.aet, DEFAULT_AET);
		assert_eq!(config.scp.port, 11112);
		assert_eq!(config.metadata.ttl_minutes, 5);
		assert!(config.aet_directory.is_empty());
	}
}
