//! Paragraph synthesis.
//!
//! The player asks a [`Synthesizer`] for one audio file per paragraph. Two
//! implementations ship with the crate: [`CommandSynthesizer`] pipes the text
//! into an external TTS program (piper, espeak-ng, ...) and
//! [`SilenceSynthesizer`] writes silent WAV files sized to the paragraph,
//! for dry runs. Output is always written to a temporary sibling first and
//! renamed into place so a half-written file is never picked up by the cache.

use crate::document::Paragraph;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use hound::WavSpec;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub book_id: String,
    pub paragraph: Paragraph,
    /// Where the audio should end up. Implementations may pick another
    /// extension and report the real path back.
    pub output: PathBuf,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Produce a playable audio file for the paragraph. May fail transiently.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf>;
}

/// Runs an external program per paragraph. The text goes to stdin; an
/// `{output}` argument is replaced by the file to write. Without that
/// placeholder the program's stdout is taken as the audio.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        info!(%program, ?args, "Initializing command TTS");
        Self { program, args }
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        let output = &request.output;
        ensure_parent(output)?;
        let temp = unique_temp_path(output);
        let temp_arg = temp.to_string_lossy().to_string();
        let writes_file = self.args.iter().any(|arg| arg.contains(OUTPUT_PLACEHOLDER));
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &temp_arg))
            .collect();

        debug!(
            program = %self.program,
            locator = %request.paragraph.locator,
            chars = request.paragraph.text.len(),
            "Synthesizing paragraph with external command"
        );
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Spawning TTS command {}", self.program))?;

        // Fed from its own task so a program streaming audio to stdout
        // cannot block on a full pipe while we are still writing.
        let feeder = child.stdin.take().map(|mut stdin| {
            let text = request.paragraph.text.clone();
            tokio::spawn(async move {
                stdin.write_all(text.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            })
        });
        let result = child
            .wait_with_output()
            .await
            .context("Waiting for TTS command")?;

        if !result.status.success() {
            let _ = fs::remove_file(&temp);
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "TTS command exited with {}: {}",
                result.status,
                stderr.trim()
            );
        }
        if let Some(feeder) = feeder {
            feeder
                .await
                .map_err(|err| anyhow!("TTS stdin task failed: {err}"))?
                .context("Writing paragraph to TTS stdin")?;
        }
        if !writes_file {
            fs::write(&temp, &result.stdout).context("Writing TTS stdout to file")?;
        }
        let written = fs::metadata(&temp).map(|meta| meta.len()).unwrap_or(0);
        if written == 0 {
            let _ = fs::remove_file(&temp);
            bail!("TTS command produced no audio");
        }
        move_into_place(&temp, output)?;
        Ok(output.clone())
    }
}

/// Writes silence proportional to the paragraph's word count.
pub struct SilenceSynthesizer {
    per_word: Duration,
    sample_rate: u32,
}

impl SilenceSynthesizer {
    pub fn new(per_word: Duration) -> Self {
        Self {
            per_word,
            sample_rate: 22_050,
        }
    }

    fn duration_for(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count().max(1) as u32;
        self.per_word * words
    }
}

impl Default for SilenceSynthesizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(60))
    }
}

#[async_trait]
impl Synthesizer for SilenceSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<PathBuf> {
        let duration = self.duration_for(&request.paragraph.text);
        let samples = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let output = request.output.with_extension("wav");
        let sample_rate = self.sample_rate;
        let target = output.clone();
        tokio::task::spawn_blocking(move || write_wav(&target, sample_rate, 1, &vec![0.0; samples]))
            .await
            .map_err(|err| anyhow!("WAV writer task failed: {err}"))??;
        debug!(
            path = %output.display(),
            ms = duration.as_millis() as u64,
            "Wrote silent paragraph audio"
        );
        Ok(output)
    }
}

/// Exhausted retries: how many attempts ran and the last failure.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: usize,
    pub last: anyhow::Error,
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures. The
/// operation is assumed safe to repeat; synthesis backends may end up doing
/// the same work twice.
pub async fn retry<T, F, Fut>(
    attempts: usize,
    delay: Duration,
    mut op: F,
) -> std::result::Result<T, RetryExhausted>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                warn!(attempt, attempts, "Attempt failed, retrying: {err:#}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[f32]) -> Result<()> {
    ensure_parent(path)?;
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let temp_path = unique_temp_path(path);
    let mut writer = hound::WavWriter::create(&temp_path, spec)
        .with_context(|| format!("Creating WAV {}", temp_path.display()))?;
    for &s in samples {
        let clamped = (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        writer.write_sample(clamped)?;
    }
    writer.finalize()?;
    move_into_place(&temp_path, path)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Creating audio directory {}", parent.display()))?;
    }
    Ok(())
}

fn move_into_place(temp: &Path, path: &Path) -> Result<()> {
    if fs::rename(temp, path).is_err() {
        fs::copy(temp, path)
            .with_context(|| format!("Copying {} to {}", temp.display(), path.display()))?;
        let _ = fs::remove_file(temp);
    }
    Ok(())
}

fn unique_temp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nonce = SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let stem = path
        .file_stem()
        .and_then(|f| f.to_str())
        .unwrap_or("audio");
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!(
        ".{stem}.{}.{ts_nanos}.{nonce}.part.{extension}",
        std::process::id()
    ))
}
