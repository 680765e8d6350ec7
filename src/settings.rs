use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::WavereqError;

/// Typed replacement for the key/value configuration proxy: every knob has a
/// default, a settings file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service_root: String,
    pub routing: bool,
    pub router_url: String,
    pub fdsnws_url: String,
    pub total_line_limit: u64,
    pub total_size_limit: u64,
    pub line_limit: u64,
    pub size_limit: u64,
    pub local_line_limit: u64,
    pub status_limit: usize,
    pub store_root: Option<Utf8PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_root: "/webinterface/".to_string(),
            routing: true,
            router_url: "/eidaws/routing/1/query".to_string(),
            fdsnws_url: "/fdsnws".to_string(),
            total_line_limit: 10_000,
            total_size_limit: 10_000,
            line_limit: 990,
            size_limit: 500,
            local_line_limit: 4_990,
            status_limit: 100,
            store_root: None,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self, WavereqError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("wavereq.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(WavereqError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| WavereqError::ConfigRead(config_path.clone()))?;
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|err| WavereqError::ConfigParse(err.to_string()))?;
        Ok(settings)
    }

    /// Like `load`, but a missing default config falls back to defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self, WavereqError> {
        match Self::load(path) {
            Err(WavereqError::MissingConfig) => Ok(Self::default()),
            other => other,
        }
    }

    /// Service root with a guaranteed trailing slash.
    pub fn service_root(&self) -> String {
        let trimmed = self.service_root.trim_end_matches('/');
        format!("{trimmed}/")
    }

    /// Local FDSNWS root with trailing slashes stripped.
    pub fn fdsnws_root(&self) -> String {
        self.fdsnws_url.trim_end_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert!(settings.routing);
        assert_eq!(settings.total_line_limit, 10_000);
        assert_eq!(settings.line_limit, 990);
        assert_eq!(settings.local_line_limit, 4_990);
    }

    #[test]
    fn partial_override() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "routing": false,
                "fdsnws_url": "http://dc.example/fdsnws//",
                "store_root": "/var/lib/wavereq"
            }"#,
        )
        .unwrap();
        assert!(!settings.routing);
        assert_eq!(settings.fdsnws_root(), "http://dc.example/fdsnws");
        assert_eq!(settings.size_limit, 500);
        assert_eq!(
            settings.store_root.as_deref(),
            Some(camino::Utf8Path::new("/var/lib/wavereq"))
        );
    }
}
