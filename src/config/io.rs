use super::AppConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Load configuration from the given path, falling back to defaults on error.
pub fn load_config(path: &Path) -> AppConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded base config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return AppConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err:#}");
            AppConfig::default()
        }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    toml::from_str::<AppConfig>(contents).context("Parsing config TOML")
}

pub fn serialize_config(config: &AppConfig) -> Result<String> {
    toml::to_string(config).context("Serializing config TOML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn missing_fields_use_defaults() {
        let cfg = parse_config("log_level = \"debug\"\nsynthesis_retry_attempts = 5\n").unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.synthesis_retry_attempts, 5);
        assert_eq!(cfg.synthesis_retry_delay_ms, 50);
        assert_eq!(cfg.audio_cache_capacity, 512);
        assert_eq!(cfg.sentences_per_paragraph, 8);
        assert_eq!(cfg.min_paragraph_length, 50);
    }

    #[test]
    fn serialized_config_parses_back() {
        let mut cfg = AppConfig::default();
        cfg.tts_command = "espeak-ng".into();
        cfg.tts_args = vec!["-w".into(), "{output}".into()];
        let text = serialize_config(&cfg).unwrap();
        assert_eq!(parse_config(&text).unwrap(), cfg);
    }

    #[test]
    fn unreadable_or_invalid_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_config(&dir.path().join("missing.toml")), AppConfig::default());

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "log_level = [").unwrap();
        assert_eq!(load_config(&bad), AppConfig::default());
    }
}
