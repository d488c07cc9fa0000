//! Command-line narrator.
//!
//! Responsibilities here are intentionally minimal:
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml`.
//! - Open the book with the backend its format calls for.
//! - Narrate until the book ends or Ctrl-C is pressed.

use anyhow::{Context, Result, anyhow};
use paged_narrator::audio::{AudioOutput, RodioOutput};
use paged_narrator::cache::sha256_hex;
use paged_narrator::config::{AppConfig, load_config};
use paged_narrator::document::{
    DocumentAdapter, FixedPageAdapter, LinePages, RangeAdapter, ReflowRenderer, TextReflow,
};
use paged_narrator::library::{BookEntry, BookLibrary, LocationStore};
use paged_narrator::source::{Layout, SourceText, load_source};
use paged_narrator::tts::{CommandSynthesizer, SilenceSynthesizer, Synthesizer};
use paged_narrator::{AppContext, EventKind, Player, PlayerEvent, PlayingState};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

struct Args {
    book: PathBuf,
    dry_run: bool,
}

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let args = parse_args()?;
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        path = %args.book.display(),
        level = %config.log_level,
        dry_run = args.dry_run,
        "Starting narrator"
    );
    info!(
        command = %config.tts_command,
        args = ?config.tts_args,
        retries = config.synthesis_retry_attempts,
        cache_dir = %config.cache_dir,
        "Active TTS configuration"
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    runtime.block_on(narrate(args, config))
}

async fn narrate(args: Args, config: AppConfig) -> Result<()> {
    let source = load_source(&args.book)?;
    let book_id = book_id_for(&args.book)?;

    let library = Arc::new(BookLibrary::new(&config.library_path));
    library
        .add_book(BookEntry {
            id: book_id.clone(),
            title: source.title.clone(),
            path: args.book.clone(),
            location: None,
        })
        .await?;
    let stored = library.get_book_location(&book_id).await?;
    if let Some(locator) = &stored {
        info!(%locator, "Resuming from saved location");
    }

    let ctx = AppContext::new(config).with_store(library);
    let adapter = open_adapter(&source, &ctx, stored.as_deref());
    let synthesizer: Arc<dyn Synthesizer> = if args.dry_run {
        Arc::new(SilenceSynthesizer::default())
    } else {
        Arc::new(CommandSynthesizer::new(
            ctx.config.tts_command.clone(),
            ctx.config.tts_args.clone(),
        ))
    };
    let output: Arc<dyn AudioOutput> = Arc::new(RodioOutput::open(ctx.config.tts_volume)?);

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    ctx.hub.subscribe(EventKind::PlayingStateChanged, move |event| {
        if let PlayerEvent::PlayingStateChanged(state) = event {
            let _ = state_tx.send(*state);
        }
    });
    ctx.hub.subscribe(EventKind::PlayingAudio, |event| {
        if let PlayerEvent::PlayingAudio(paragraph) = event {
            let preview: String = paragraph.text.chars().take(80).collect();
            info!(locator = %paragraph.locator, "Narrating: {preview}");
        }
    });

    let player = Player::new(&ctx, Arc::clone(&adapter), synthesizer, output);
    player.initialize(&book_id).await?;
    adapter.display().await.context("Displaying first page")?;
    if let Some(locator) = &stored {
        let target = player
            .current_paragraphs()
            .iter()
            .position(|paragraph| &paragraph.locator == locator)
            .unwrap_or(0);
        for _ in 0..target {
            player.move_to_next_paragraph().await?;
        }
    }

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Installing Ctrl-C handler")?;

    if let Err(err) = player.play().await {
        warn!("Narration paused: {err}");
    }

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("Interrupted; stopping narration");
                break;
            }
            _ = player.wait_for_end() => {
                info!("Reached the end of the book");
                break;
            }
            state = state_rx.recv() => {
                let Some(state) = state else { break };
                if state == PlayingState::Paused && !player.errors().is_empty() {
                    warn!(errors = player.errors().len(), "Narration paused after errors");
                    break;
                }
            }
        }
    }

    player.stop().await?;
    player.close().await?;
    Ok(())
}

fn open_adapter(
    source: &SourceText,
    ctx: &AppContext,
    stored: Option<&str>,
) -> Arc<dyn DocumentAdapter> {
    match source.layout {
        Layout::Reflowable => {
            let mut reflow = TextReflow::new(source.text.clone(), ctx.config.font_size);
            if let Some(page) = stored.and_then(|locator| reflow.page_for_locator(locator)) {
                if let Err(err) = reflow.go_to_page(page) {
                    warn!(page, "Could not reopen saved page: {err}");
                }
            }
            Arc::new(RangeAdapter::new(reflow, Arc::clone(&ctx.hub)))
        }
        Layout::FixedPage => {
            let pages = LinePages::new(&source.text, ctx.config.lines_per_page);
            let start = stored
                .and_then(|locator| pages.page_for_locator(locator))
                .unwrap_or(0);
            Arc::new(FixedPageAdapter::open(
                pages,
                Arc::clone(&ctx.hub),
                ctx.config.segmenter_options(),
                start,
            ))
        }
    }
}

fn book_id_for(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Resolving {}", path.display()))?;
    let hash = sha256_hex(canonical.to_string_lossy().as_bytes());
    Ok(hash[..16].to_string())
}

fn parse_args() -> Result<Args> {
    let mut book = None;
    let mut dry_run = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            _ if book.is_none() => book = Some(PathBuf::from(arg)),
            _ => return Err(anyhow!("Unexpected argument: {arg}")),
        }
    }
    let book = book.ok_or_else(|| anyhow!("Usage: narrator <path-to-book> [--dry-run]"))?;
    if !book.exists() {
        return Err(anyhow!("File not found: {}", book.display()));
    }
    Ok(Args { book, dry_run })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
