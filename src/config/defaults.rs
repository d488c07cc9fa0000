use crate::segmenter::{DEFAULT_MIN_PARAGRAPH_LENGTH, DEFAULT_SENTENCES_PER_PARAGRAPH};

pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Info
}

pub(crate) fn default_cache_dir() -> String {
    ".cache".to_string()
}

pub(crate) fn default_library_path() -> String {
    ".cache/library.toml".to_string()
}

pub(crate) fn default_tts_command() -> String {
    "piper".to_string()
}

pub(crate) fn default_tts_args() -> Vec<String> {
    vec![
        "--model".to_string(),
        "/usr/share/piper-voices/en/en_US/ryan/high/en_US-ryan-high.onnx".to_string(),
        "--output_file".to_string(),
        crate::tts::OUTPUT_PLACEHOLDER.to_string(),
    ]
}

pub(crate) fn default_tts_output_extension() -> String {
    "wav".to_string()
}

pub(crate) fn default_tts_volume() -> f32 {
    1.0
}

pub(crate) fn default_synthesis_retry_attempts() -> usize {
    3
}

pub(crate) fn default_synthesis_retry_delay_ms() -> u64 {
    50
}

pub(crate) fn default_audio_cache_capacity() -> usize {
    512
}

pub(crate) fn default_sentences_per_paragraph() -> usize {
    DEFAULT_SENTENCES_PER_PARAGRAPH
}

pub(crate) fn default_min_paragraph_length() -> usize {
    DEFAULT_MIN_PARAGRAPH_LENGTH
}

pub(crate) fn default_lines_per_page() -> usize {
    40
}

pub(crate) fn default_font_size() -> u32 {
    16
}
