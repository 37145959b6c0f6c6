// crates/vmrkl-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmrkl_channel::{transport, ChannelConfig, VerifiedFileChannel};
use vmrkl_merkle::Reference;
use vmrkl_scheduler::{Aggressive, DefaultStrategy, Strategy};

#[derive(Parser, Debug)]
#[command(
    name = "vmrkl",
    about = "vmrkl reference CLI",
    long_about = "vmrkl reference CLI.\n\nBuild a .mref from a local file, verify one against a local file, and drive a verified channel's read/prebuffer against a remote artifact.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Hash a local file in parallel and write a .mref reference.
    Build {
        /// Source file to hash.
        #[arg(long)]
        source: PathBuf,
        /// Chunk size in bytes (must be a power of two).
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        chunk_size: u64,
        /// Output path for the .mref file.
        #[arg(long, default_value = "artifact.mref")]
        out: PathBuf,
        /// Number of hashing worker threads (defaults to available cores).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Rebuild a reference from a local file and compare its root hash
    /// against a previously published .mref.
    Verify {
        /// Local file to rebuild a reference from.
        #[arg(long)]
        source: PathBuf,
        /// Published .mref to check against.
        #[arg(long)]
        reference: PathBuf,
        /// Number of hashing worker threads (defaults to available cores).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Open a verified channel against a remote artifact and perform one
    /// read, printing the number of bytes read.
    Fetch {
        /// Local cache file path (created/reused).
        #[arg(long)]
        cache: PathBuf,
        /// Local state (.mrkl) file path (created/reused).
        #[arg(long)]
        state: PathBuf,
        /// Local .mref reference for the remote artifact.
        #[arg(long)]
        reference: PathBuf,
        /// Remote artifact URL (file://, http://, https://).
        #[arg(long)]
        url: String,
        /// Byte offset to read from.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read.
        #[arg(long)]
        length: u64,
        /// Scheduling strategy: "default" or "aggressive".
        #[arg(long, default_value = "default")]
        strategy: String,
    },

    /// Like `fetch`, but ensures every chunk covering the range is valid
    /// without returning the bytes (always uses the aggressive schedule
    /// internally; §4.6).
    Prebuffer {
        /// Local cache file path (created/reused).
        #[arg(long)]
        cache: PathBuf,
        /// Local state (.mrkl) file path (created/reused).
        #[arg(long)]
        state: PathBuf,
        /// Local .mref reference for the remote artifact.
        #[arg(long)]
        reference: PathBuf,
        /// Remote artifact URL (file://, http://, https://).
        #[arg(long)]
        url: String,
        /// Byte offset to prebuffer from.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to prebuffer.
        #[arg(long)]
        length: u64,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;

    match cli.cmd {
        Cmd::Build {
            source,
            chunk_size,
            out,
            workers,
        } => runtime.block_on(build(source, chunk_size, out, workers)),

        Cmd::Verify {
            source,
            reference,
            workers,
        } => runtime.block_on(verify(source, reference, workers)),

        Cmd::Fetch {
            cache,
            state,
            reference,
            url,
            offset,
            length,
            strategy,
        } => runtime.block_on(fetch(cache, state, reference, url, offset, length, strategy)),

        Cmd::Prebuffer {
            cache,
            state,
            reference,
            url,
            offset,
            length,
        } => runtime.block_on(prebuffer(cache, state, reference, url, offset, length)),
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Ensure the parent directory for a file exists.
fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating parent directory {}", dir.display()))?;
        }
    }
    Ok(())
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner} [{bar:40}] {pos}/{len} chunks ({eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

async fn build(source: PathBuf, chunk_size: u64, out: PathBuf, workers: Option<usize>) -> Result<()> {
    info!(source=%source.display(), chunk_size, out=%out.display(), "building reference");
    ensure_parent_dir(&out)?;

    let (mut rx, handle) = vmrkl_build::build_reference(source.clone(), chunk_size, workers)
        .await
        .with_context(|| format!("starting build for {}", source.display()))?;

    let bar = progress_bar(rx.borrow().chunks_total);
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = *rx.borrow();
            bar.set_position(snapshot.chunks_done);
            if snapshot.is_complete() {
                break;
            }
        }
        bar.finish_and_clear();
    });

    let reference = handle
        .await
        .context("build task panicked")?
        .context("building reference")?;
    let _ = watcher.await;

    reference
        .save(&out)
        .with_context(|| format!("writing {}", out.display()))?;

    println!(
        "Built {} → {} ({} chunks, root {})",
        source.display(),
        out.display(),
        reference.shape().leaf_count(),
        hex::encode(reference.root_hash())
    );
    Ok(())
}

async fn verify(source: PathBuf, reference_path: PathBuf, workers: Option<usize>) -> Result<()> {
    info!(source=%source.display(), reference=%reference_path.display(), "verifying against published reference");

    let published = Reference::load(&reference_path)
        .with_context(|| format!("loading {}", reference_path.display()))?;

    let rebuilt =
        vmrkl_build::build_reference_blocking(&source, published.shape().chunk_size(), workers, None)
            .with_context(|| format!("rebuilding reference from {}", source.display()))?;

    if rebuilt.root_hash() == published.root_hash() {
        println!("OK: {} matches {}", source.display(), reference_path.display());
        return Ok(());
    }

    let mismatched = mismatched_byte_ranges(&published, &rebuilt);
    eprintln!(
        "MISMATCH: {} does not match {} ({} mismatched range(s))",
        source.display(),
        reference_path.display(),
        mismatched.len()
    );
    for (start, end) in &mismatched {
        eprintln!("  [{start}, {end})");
    }
    bail!(
        "root hash mismatch: published {} rebuilt {}",
        hex::encode(published.root_hash()),
        hex::encode(rebuilt.root_hash())
    );
}

/// Diff two references of identical shape leaf-by-leaf, grouping
/// mismatched chunk indices into contiguous byte ranges.
fn mismatched_byte_ranges(a: &Reference, b: &Reference) -> Vec<(u64, u64)> {
    let shape = a.shape();
    let mut mismatched_chunks = Vec::new();
    for k in 0..shape.leaf_count() {
        let Ok(node) = shape.chunk_index_to_leaf_node(k) else {
            continue;
        };
        if a.hash(node) != b.hash(node) {
            mismatched_chunks.push(k);
        }
    }

    let mut ranges = Vec::new();
    let mut iter = mismatched_chunks.into_iter();
    let Some(mut run_start) = iter.next() else {
        return ranges;
    };
    let mut run_end = run_start + 1;
    for k in iter {
        if k == run_end {
            run_end = k + 1;
        } else {
            ranges.push(chunk_run_to_byte_range(&shape, run_start, run_end));
            run_start = k;
            run_end = k + 1;
        }
    }
    ranges.push(chunk_run_to_byte_range(&shape, run_start, run_end));
    ranges
}

fn chunk_run_to_byte_range(shape: &vmrkl_core::shape::Shape, start: u64, end: u64) -> (u64, u64) {
    let chunk_size = shape.chunk_size();
    let byte_start = start * chunk_size;
    let byte_end = (end * chunk_size).min(shape.total_size());
    (byte_start, byte_end)
}

async fn open_channel(
    cache: &Path,
    state: &Path,
    reference_path: &Path,
    url: &str,
    strategy: Arc<dyn Strategy>,
) -> Result<VerifiedFileChannel> {
    let reference = Arc::new(
        Reference::load(reference_path)
            .with_context(|| format!("loading {}", reference_path.display()))?,
    );
    let registry = transport::default_registry();
    let remote = registry.open(url).with_context(|| format!("opening transport for {url}"))?;

    VerifiedFileChannel::open(cache, state, reference, remote, strategy, ChannelConfig::default())
        .await
        .context("opening verified file channel")
}

async fn fetch(
    cache: PathBuf,
    state: PathBuf,
    reference_path: PathBuf,
    url: String,
    offset: u64,
    length: u64,
    strategy: String,
) -> Result<()> {
    ensure_parent_dir(&cache)?;
    ensure_parent_dir(&state)?;

    let strategy: Arc<dyn Strategy> = match strategy.as_str() {
        "aggressive" => Arc::new(Aggressive),
        "default" => Arc::new(DefaultStrategy),
        other => bail!("unknown strategy {other:?}; expected \"default\" or \"aggressive\""),
    };

    info!(cache=%cache.display(), url, offset, length, "opening channel");
    let channel = open_channel(&cache, &state, &reference_path, &url, strategy).await?;

    let mut buf = vec![0u8; length as usize];
    let n = channel
        .read(&mut buf, offset)
        .await
        .context("read failed")?;
    channel.close().await.context("closing channel")?;

    println!("Read {n} byte(s) at offset {offset} from {url}");
    Ok(())
}

async fn prebuffer(
    cache: PathBuf,
    state: PathBuf,
    reference_path: PathBuf,
    url: String,
    offset: u64,
    length: u64,
) -> Result<()> {
    ensure_parent_dir(&cache)?;
    ensure_parent_dir(&state)?;

    info!(cache=%cache.display(), url, offset, length, "prebuffering");
    let channel = open_channel(
        &cache,
        &state,
        &reference_path,
        &url,
        Arc::new(DefaultStrategy),
    )
    .await?;

    channel
        .prebuffer(offset, length)
        .await
        .context("prebuffer failed")?;
    channel.close().await.context("closing channel")?;

    println!("Prebuffered [{offset}, {}) from {url}", offset + length);
    Ok(())
}
