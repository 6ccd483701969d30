use qumail_core::ProtocolLevel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

pub const DEFAULT_KMS_URL: &str = "https://qumail-kms-server.onrender.com/api/keys/get_key";

pub const ENV_KMS_URL: &str = "QUMAIL_KMS_URL";
pub const ENV_KMS_API_KEY: &str = "QUMAIL_KMS_API_KEY";
pub const ENV_KMS_TIMEOUT: &str = "QUMAIL_KMS_TIMEOUT_SECS";
pub const ENV_SPOOL_DIR: &str = "QUMAIL_SPOOL_DIR";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{var} has an invalid value: {value}")]
    InvalidOverride { var: &'static str, value: String },
    #[error("settings field {field} must be positive")]
    NotPositive { field: &'static str },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KmsSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub key_size: usize,
}

impl Default for KmsSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_KMS_URL.into(),
            timeout_secs: 10,
            key_size: qumail_core::kms_client::DEFAULT_KEY_SIZE,
        }
    }
}

/// Persisted client settings. Secrets (app password, KMS API key) live in
/// the OS keyring and are never written here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub kms: KmsSettings,
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    #[serde(default = "default_level")]
    pub default_level: ProtocolLevel,
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,
}

fn default_level() -> ProtocolLevel {
    ProtocolLevel::Aes
}

fn default_transport_timeout() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identity: None,
            kms: KmsSettings::default(),
            spool_dir: None,
            default_level: default_level(),
            transport_timeout_secs: default_transport_timeout(),
        }
    }
}

impl Settings {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let settings: Self = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.kms.timeout_secs == 0 {
            return Err(SettingsError::NotPositive { field: "kms.timeout_secs" });
        }
        if self.kms.key_size == 0 {
            return Err(SettingsError::NotPositive { field: "kms.key_size" });
        }
        if self.transport_timeout_secs == 0 {
            return Err(SettingsError::NotPositive {
                field: "transport_timeout_secs",
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut staging = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staging, self)?;
        staging.write_all(b"\n")?;
        staging.as_file().sync_all()?;
        staging.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Applies environment overrides. `lookup` is `std::env::var` in the binary.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_KMS_URL).filter(|v| !v.trim().is_empty()) {
            self.kms.url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_KMS_TIMEOUT) {
            self.kms.timeout_secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(SettingsError::InvalidOverride {
                    var: ENV_KMS_TIMEOUT,
                    value: raw,
                })?;
        }
        if let Some(dir) = lookup(ENV_SPOOL_DIR).filter(|v| !v.trim().is_empty()) {
            self.spool_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn kms_timeout(&self) -> Duration {
        Duration::from_secs(self.kms.timeout_secs)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.kms.url, DEFAULT_KMS_URL);
        assert_eq!(settings.default_level, ProtocolLevel::Aes);
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.identity = Some("me@example.com".into());
        settings.default_level = ProtocolLevel::PqcHybrid;
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"PQC_HYBRID\""));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"identity":"me@example.com"}"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.identity.as_deref(), Some("me@example.com"));
        assert_eq!(settings.kms, KmsSettings::default());
        assert_eq!(settings.transport_timeout_secs, 10);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn zero_timeouts_in_file_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        fs::write(&path, r#"{"kms":{"url":"http://kms","timeout_secs":0,"key_size":32}}"#).unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SettingsError::NotPositive { field: "kms.timeout_secs" })
        ));

        fs::write(&path, r#"{"transport_timeout_secs":0}"#).unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SettingsError::NotPositive { field: "transport_timeout_secs" })
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(env(&[
                (ENV_KMS_URL, "http://127.0.0.1:8080/keys"),
                (ENV_KMS_TIMEOUT, "3"),
                (ENV_SPOOL_DIR, "/tmp/qumail-out"),
            ]))
            .unwrap();
        assert_eq!(settings.kms.url, "http://127.0.0.1:8080/keys");
        assert_eq!(settings.kms_timeout(), Duration::from_secs(3));
        assert_eq!(settings.spool_dir, Some(PathBuf::from("/tmp/qumail-out")));
    }

    #[test]
    fn bad_timeout_override_is_rejected() {
        let mut settings = Settings::default();
        for raw in ["soon", "0", "-1"] {
            let err = settings
                .apply_overrides(env(&[(ENV_KMS_TIMEOUT, raw)]))
                .unwrap_err();
            assert!(matches!(err, SettingsError::InvalidOverride { var, .. } if var == ENV_KMS_TIMEOUT));
        }
        assert_eq!(settings.kms.timeout_secs, 10);
    }
}
