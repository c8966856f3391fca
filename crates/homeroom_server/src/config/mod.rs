#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use homeroom_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.homeroom/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".homeroom").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Gateway settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional management REST API bind address (host:port).
	pub rest_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Verbs are rejected as
	/// unauthenticated when unset.
	pub auth_hmac_secret: Option<SecretString>,
	/// Origins accepted in `Hello`. Empty means any origin is accepted.
	pub allowed_origins: Vec<String>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:).
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite:homeroom.db?mode=rwc".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	rest_bind: Option<String>,
	auth_hmac_secret: Option<String>,

	#[serde(default)]
	allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				rest_bind: file.server.rest_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allowed_origins: file
					.server
					.allowed_origins
					.into_iter()
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect(),
			},
			persistence: PersistenceSettings {
				database_url: file
					.persistence
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| PersistenceSettings::default().database_url),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HOMEROOM_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_REST_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.rest_bind = Some(v);
			info!("server config: rest_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_ALLOWED_ORIGINS") {
		let origins: Vec<String> = v
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
		if !origins.is_empty() {
			cfg.server.allowed_origins = origins;
			info!("server config: allowed_origins overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOMEROOM_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_config_maps_and_trims() {
		let file: FileConfig = toml::from_str(
			r#"
[server]
metrics_bind = "127.0.0.1:9300"
auth_hmac_secret = "  shh  "
allowed_origins = ["http://localhost:5001", "  ", "https://app.homeroom.example"]

[persistence]
database_url = "sqlite::memory:"
"#,
		)
		.expect("parse toml");

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9300"));
		assert!(cfg.server.auth_hmac_secret.is_some());
		assert_eq!(
			cfg.server.allowed_origins,
			vec!["http://localhost:5001".to_string(), "https://app.homeroom.example".to_string()]
		);
		assert_eq!(cfg.persistence.database_url, "sqlite::memory:");
	}

	#[test]
	fn empty_file_config_uses_defaults() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.server.allowed_origins.is_empty());
		assert_eq!(cfg.persistence.database_url, "sqlite:homeroom.db?mode=rwc");
	}
}
