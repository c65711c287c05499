use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_CHUNK_THRESHOLD_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_BLOCK_CONCURRENCY: usize = 4;
pub const DEFAULT_PENDING_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_PENDING_MAX_ATTEMPTS: u32 = 20;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// Missing keys in any table fall back to [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    pub token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub container_url: String,
    pub sas_token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub concurrency: u32,
    pub recursive: bool,
    pub extensions: Vec<String>,
    pub listing_policy: String,
    pub pending_interval_ms: u64,
    pub pending_max_attempts: u32,
    pub chunk_threshold_bytes: u64,
    pub block_size_bytes: u64,
    pub block_concurrency: u32,
}

fn default_source_token_env() -> String {
    "BLOBFERRY_SOURCE_TOKEN".to_string()
}

fn default_sink_sas_env() -> String {
    "BLOBFERRY_SINK_SAS".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            source: SourceSettings::default(),
            sink: SinkSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: default_source_token_env(),
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            container_url: String::new(),
            sas_token_env: default_sink_sas_env(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            recursive: true,
            extensions: Vec::new(),
            listing_policy: "best_effort".to_string(),
            pending_interval_ms: DEFAULT_PENDING_INTERVAL_MS,
            pending_max_attempts: DEFAULT_PENDING_MAX_ATTEMPTS,
            chunk_threshold_bytes: DEFAULT_CHUNK_THRESHOLD_BYTES,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            block_concurrency: DEFAULT_BLOCK_CONCURRENCY as u32,
        }
    }
}

/// What traversal does when listing one folder fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingPolicy {
    /// Log the folder and keep walking the other branches.
    #[default]
    BestEffort,
    /// Abort discovery on the first listing failure.
    FailFast,
}

impl ListingPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "best_effort" => Ok(Self::BestEffort),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(Error::InvalidConfig {
                message: format!(
                    "transfer.listing_policy must be \"best_effort\" or \"fail_fast\", got {other:?}"
                ),
            }),
        }
    }
}

/// Byte-transfer tuning for one run.
#[derive(Debug, Clone)]
pub struct UploadTuning {
    pub chunk_threshold_bytes: u64,
    pub block_size_bytes: u64,
    pub block_concurrency: usize,
}

impl Default for UploadTuning {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: DEFAULT_CHUNK_THRESHOLD_BYTES,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
            block_concurrency: DEFAULT_BLOCK_CONCURRENCY,
        }
    }
}

/// Bounded wait for registrations the source store prepares asynchronously.
#[derive(Debug, Clone)]
pub struct PendingPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PendingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_PENDING_INTERVAL_MS),
            max_attempts: DEFAULT_PENDING_MAX_ATTEMPTS,
        }
    }
}

pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

impl TransferSettings {
    pub fn listing_policy(&self) -> Result<ListingPolicy> {
        ListingPolicy::parse(&self.listing_policy)
    }

    pub fn upload_tuning(&self) -> UploadTuning {
        UploadTuning {
            chunk_threshold_bytes: self.chunk_threshold_bytes,
            block_size_bytes: self.block_size_bytes,
            block_concurrency: (self.block_concurrency as usize).max(1),
        }
    }

    pub fn pending_policy(&self) -> PendingPolicy {
        PendingPolicy {
            interval: Duration::from_millis(self.pending_interval_ms),
            max_attempts: self.pending_max_attempts,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "unsupported settings schema version: {} (expected {SETTINGS_SCHEMA_VERSION})",
                settings.version
            ),
        });
    }
    Ok(settings)
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!("version must be {SETTINGS_SCHEMA_VERSION}"),
        });
    }
    validate_url_field("source.base_url", &settings.source.base_url)?;
    validate_url_field("sink.container_url", &settings.sink.container_url)?;

    let t = &settings.transfer;
    t.listing_policy()?;
    if t.pending_max_attempts == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.pending_max_attempts must be >= 1".to_string(),
        });
    }
    if t.block_size_bytes == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.block_size_bytes must be > 0".to_string(),
        });
    }
    if t.chunk_threshold_bytes == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer.chunk_threshold_bytes must be > 0".to_string(),
        });
    }
    for ext in &t.extensions {
        if ext.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "transfer.extensions must not contain empty entries".to_string(),
            });
        }
    }
    Ok(())
}

// Empty is allowed here; the run itself refuses to start without endpoints.
fn validate_url_field(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if !(value.starts_with("https://") || value.starts_with("http://")) {
        return Err(Error::InvalidConfig {
            message: format!("{field} must be an http(s) url"),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let s = parse_settings(
            r#"
version = 1

[source]
base_url = "https://docs.example.com/api"

[sink]
container_url = "https://acct.blob.core.windows.net/exports"
"#,
        )
        .unwrap();

        assert_eq!(s.source.token_env, "BLOBFERRY_SOURCE_TOKEN");
        assert_eq!(s.sink.sas_token_env, "BLOBFERRY_SINK_SAS");
        assert_eq!(s.transfer.concurrency, 4);
        assert_eq!(s.transfer.pending_max_attempts, 20);
        assert_eq!(s.transfer.chunk_threshold_bytes, 256 * 1024 * 1024);
        assert_eq!(
            s.transfer.listing_policy().unwrap(),
            ListingPolicy::BestEffort
        );
        validate_settings(&s).unwrap();
    }

    #[test]
    fn partial_tables_keep_defaults_for_missing_keys() {
        let s = parse_settings(
            r#"
version = 1

[source]
token_env = "DOCS_TOKEN"

[transfer]
concurrency = 2
extensions = ["pdf"]
"#,
        )
        .unwrap();

        assert_eq!(s.source.token_env, "DOCS_TOKEN");
        assert_eq!(s.source.base_url, "");
        assert_eq!(s.sink.sas_token_env, "BLOBFERRY_SINK_SAS");
        assert_eq!(s.transfer.concurrency, 2);
        assert!(s.transfer.recursive);
        assert_eq!(s.transfer.listing_policy, "best_effort");
        assert_eq!(s.transfer.pending_interval_ms, DEFAULT_PENDING_INTERVAL_MS);
        assert_eq!(s.transfer.block_size_bytes, DEFAULT_BLOCK_SIZE_BYTES);
        assert_eq!(
            s.transfer.block_concurrency as usize,
            DEFAULT_BLOCK_CONCURRENCY
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_settings("version = 7\n").unwrap_err();
        assert!(err.to_string().contains("schema version"));
    }

    #[test]
    fn unknown_listing_policy_is_rejected() {
        let mut s = Settings::default();
        s.transfer.listing_policy = "sometimes".to_string();
        let err = validate_settings(&s).unwrap_err();
        assert!(err.to_string().contains("listing_policy"));
    }

    #[test]
    fn non_http_container_url_is_rejected() {
        let mut s = Settings::default();
        s.sink.container_url = "ftp://nope".to_string();
        let err = validate_settings(&s).unwrap_err();
        assert!(err.to_string().contains("sink.container_url"));
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(4), 4);
        assert_eq!(clamp_concurrency(64), 10);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let temp = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.transfer.extensions = vec![".pdf".to_string(), ".DWG".to_string()];
        s.transfer.listing_policy = "fail_fast".to_string();
        save_settings(temp.path(), &s).unwrap();

        let loaded = load_settings(temp.path()).unwrap();
        assert_eq!(loaded.transfer.extensions, s.transfer.extensions);
        assert_eq!(
            loaded.transfer.listing_policy().unwrap(),
            ListingPolicy::FailFast
        );
        assert!(!temp.path().join("config.tmp").exists());
    }
}
