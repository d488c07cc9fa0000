use crate::segmenter::SegmenterOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Narrator configuration; deserializable from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "crate::config::defaults::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "crate::config::defaults::default_library_path")]
    pub library_path: String,
    #[serde(default = "crate::config::defaults::default_tts_command")]
    pub tts_command: String,
    #[serde(default = "crate::config::defaults::default_tts_args")]
    pub tts_args: Vec<String>,
    #[serde(default = "crate::config::defaults::default_tts_output_extension")]
    pub tts_output_extension: String,
    #[serde(default = "crate::config::defaults::default_tts_volume")]
    pub tts_volume: f32,
    #[serde(default = "crate::config::defaults::default_synthesis_retry_attempts")]
    pub synthesis_retry_attempts: usize,
    #[serde(default = "crate::config::defaults::default_synthesis_retry_delay_ms")]
    pub synthesis_retry_delay_ms: u64,
    #[serde(default = "crate::config::defaults::default_audio_cache_capacity")]
    pub audio_cache_capacity: usize,
    #[serde(default = "crate::config::defaults::default_sentences_per_paragraph")]
    pub sentences_per_paragraph: usize,
    #[serde(default = "crate::config::defaults::default_min_paragraph_length")]
    pub min_paragraph_length: usize,
    #[serde(default = "crate::config::defaults::default_lines_per_page")]
    pub lines_per_page: usize,
    #[serde(default = "crate::config::defaults::default_font_size")]
    pub font_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: crate::config::defaults::default_log_level(),
            cache_dir: crate::config::defaults::default_cache_dir(),
            library_path: crate::config::defaults::default_library_path(),
            tts_command: crate::config::defaults::default_tts_command(),
            tts_args: crate::config::defaults::default_tts_args(),
            tts_output_extension: crate::config::defaults::default_tts_output_extension(),
            tts_volume: crate::config::defaults::default_tts_volume(),
            synthesis_retry_attempts: crate::config::defaults::default_synthesis_retry_attempts(),
            synthesis_retry_delay_ms: crate::config::defaults::default_synthesis_retry_delay_ms(),
            audio_cache_capacity: crate::config::defaults::default_audio_cache_capacity(),
            sentences_per_paragraph: crate::config::defaults::default_sentences_per_paragraph(),
            min_paragraph_length: crate::config::defaults::default_min_paragraph_length(),
            lines_per_page: crate::config::defaults::default_lines_per_page(),
            font_size: crate::config::defaults::default_font_size(),
        }
    }
}

impl AppConfig {
    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.synthesis_retry_delay_ms)
    }

    pub fn segmenter_options(&self) -> SegmenterOptions {
        SegmenterOptions {
            sentences_per_paragraph: self.sentences_per_paragraph,
            min_paragraph_length: self.min_paragraph_length,
        }
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Default, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
