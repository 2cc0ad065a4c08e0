use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use clap::{Parser, Subcommand};
use common::{Environment, setup_logging};
use perma::config::{parse_address, parse_size};
use perma::paths::{DEFAULT_HEAP_ADDRESS, DEFAULT_HEAP_PATH};
use perma::{BumpArena, HeapConfig, HeapInspector, HeaderRecord, OpenMode, PersistentHeap, RootCell};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Number of steps recorded so far.
static STEPS: RootCell<u64> = RootCell::new(0);
/// Address of the most recent step in the heap, 0 when empty.
static HEAD: RootCell<u64> = RootCell::new(0);

/// One entry of the step list kept in the persistent heap.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Step {
    value: u64,
    prev: u64,
}

#[derive(Parser)]
#[command(name = "perma-demo", about = "Keeps a counter list alive across restarts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh heap and record some steps.
    ///
    /// Without --heap the PERM_* environment variables are used.
    Create {
        #[arg(long)]
        heap: Option<PathBuf>,
        #[arg(long, default_value = "64M")]
        size: String,
        #[arg(long)]
        address: Option<String>,
        /// Take a backup after recording the steps
        #[arg(long)]
        backup: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        steps: u64,
    },
    /// Reopen an existing heap and record more steps.
    Resume {
        #[arg(long, default_value = DEFAULT_HEAP_PATH)]
        heap: PathBuf,
        /// Roll heap and roots back to this backup before recording
        #[arg(long)]
        restore_from: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        steps: u64,
    },
    /// Print the header of a heap or backup file as JSON.
    Inspect { file: PathBuf },
}

#[derive(Serialize)]
struct Report {
    file: PathBuf,
    file_len: usize,
    header: HeaderRecord,
    roots_blob: String,
}

fn main() -> anyhow::Result<()> {
    setup_logging(Environment::from_env());
    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            heap,
            size,
            address,
            backup,
            steps,
        } => {
            let config = match heap {
                Some(path) => {
                    let size = parse_size(&size).context("Invalid --size")?;
                    let address = match address {
                        Some(a) => parse_address(&a).context("Invalid --address")?,
                        None => Some(DEFAULT_HEAP_ADDRESS),
                    };
                    let mut config = HeapConfig::new(path, OpenMode::CREATE, size);
                    config.address = address;
                    config
                }
                None => HeapConfig::from_env()
                    .context("Invalid PERM_* configuration")?
                    .context("Neither --heap nor PERM_FNAME given")?,
            };
            create(&config, backup, steps)
        }
        Command::Resume {
            heap,
            restore_from,
            steps,
        } => resume(heap, restore_from, steps),
        Command::Inspect { file } => inspect(file),
    }
}

fn create(config: &HeapConfig, backup: Option<PathBuf>, steps: u64) -> anyhow::Result<()> {
    let arena = Arc::new(BumpArena::default());
    let heap = session(&arena)?;

    heap.open_with_config(config)
        .with_context(|| format!("Failed to open heap {}", config.path.display()))?;

    record_steps(&arena, steps)?;
    heap.flush().context("Failed to flush heap")?;

    if let Some(path) = backup {
        heap.open_backup(&path, OpenMode::CREATE)
            .with_context(|| format!("Failed to open backup {}", path.display()))?;
    }
    if heap.has_backup() {
        heap.backup().context("Failed to write backup")?;
        tracing::info!("Backup written");
    }

    report()?;
    heap.close().context("Failed to close heap")?;
    Ok(())
}

fn resume(path: PathBuf, restore_from: Option<PathBuf>, steps: u64) -> anyhow::Result<()> {
    let arena = Arc::new(BumpArena::default());
    let heap = session(&arena)?;

    heap.open(&path, OpenMode::READ_WRITE, 0)
        .with_context(|| format!("Failed to reopen heap {}", path.display()))?;

    if let Some(backup) = restore_from {
        heap.open_backup(&backup, OpenMode::READ)
            .with_context(|| format!("Failed to open backup {}", backup.display()))?;
        heap.restore().context("Failed to restore from backup")?;
        tracing::info!(steps = STEPS.get(), "Restored from backup");
    }

    record_steps(&arena, steps)?;
    report()?;
    heap.close().context("Failed to close heap")?;
    Ok(())
}

fn inspect(file: PathBuf) -> anyhow::Result<()> {
    let inspector = HeapInspector::new(&file)
        .with_context(|| format!("Failed to map {}", file.display()))?;
    let header = inspector.header().context("Not a heap file")?;
    let roots_blob = inspector
        .roots_blob()?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    let report = Report {
        file_len: inspector.file_len(),
        file,
        header,
        roots_blob,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn session(arena: &Arc<BumpArena>) -> anyhow::Result<PersistentHeap> {
    let heap = PersistentHeap::new(arena.clone());
    heap.register_cell(&STEPS)?;
    heap.register_cell(&HEAD)?;
    Ok(heap)
}

fn record_steps(arena: &BumpArena, steps: u64) -> anyhow::Result<()> {
    for _ in 0..steps {
        let value = STEPS.get() + 1;
        let step = arena
            .alloc_value(Step {
                value,
                prev: HEAD.get(),
            })
            .context("Heap exhausted")?;
        HEAD.set(step as *mut Step as u64);
        STEPS.set(value);
    }
    Ok(())
}

/// Walks the step list and prints `steps=<n> sum=<s>`.
fn report() -> anyhow::Result<()> {
    let mut count = 0u64;
    let mut sum = 0u64;
    let mut cursor = HEAD.get();
    while cursor != 0 {
        // SAFETY: every link was allocated from the heap, which stays mapped.
        let step = unsafe { *(cursor as *const Step) };
        count += 1;
        sum += step.value;
        cursor = step.prev;
    }
    if count != STEPS.get() {
        anyhow::bail!("step list has {count} entries, roots say {}", STEPS.get());
    }
    println!("steps={count} sum={sum}");
    Ok(())
}
