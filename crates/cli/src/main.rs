//! Multiprocessor coherence simulator CLI.
//!
//! This binary provides a single entry point for driving the coherence subsystem. It performs:
//! 1. **Run:** Build the system from a JSON config, start the hub and CPU threads, and drive
//!    a synthetic shared-memory workload from one thread per CPU.
//! 2. **Check:** Validate a JSON config without allocating anything.
//!
//! Logging goes to stderr through `tracing`; `RUST_LOG` overrides the level chosen by `--trace`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use smpsim_core::cbox::maf::{AccessWidth, MafType};
use smpsim_core::common::constants::IO_SPACE_BIT;
use smpsim_core::common::{BLOCK_SIZE, PhysAddr};
use smpsim_core::{BlockAllocator, CoherenceError, Config, Cpu, HeapAllocator, Result, System};

/// Blocks the workload spreads its references over.
const SHARED_BLOCKS: u64 = 16;

#[derive(Parser, Debug)]
#[command(
    name = "smpsim",
    author,
    version,
    about = "Multiprocessor cache-coherence simulator",
    long_about = "Build a shared-memory multiprocessor from a JSON config and run a synthetic \
                  workload against it.\n\nExamples:\n  smpsim run --cpus 4 -n 10000\n  \
                  smpsim run -c configs/two_cpu.json --json\n  smpsim check configs/two_cpu.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the system and run the synthetic workload.
    Run {
        /// JSON configuration file; built-in defaults when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured CPU count.
        #[arg(long)]
        cpus: Option<usize>,

        /// References issued by each CPU.
        #[arg(short = 'n', long, default_value_t = 1000)]
        iterations: u64,

        /// Log every Cbox and hub event.
        #[arg(long)]
        trace: bool,

        /// Print statistics as JSON instead of tables.
        #[arg(long)]
        json: bool,

        /// Statistics sections to print (summary, cpu, hub); all when omitted.
        #[arg(long, value_delimiter = ',')]
        stats: Vec<String>,
    },

    /// Validate a configuration file.
    Check {
        /// JSON configuration file.
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            cpus,
            iterations,
            trace,
            json,
            stats,
        } => {
            let mut config = match load_config(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(cpus) = cpus {
                config.system.cpu_count = cpus;
            }
            init_logging(trace || config.general.trace);
            match cmd_run(&config, iterations, json, &stats) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "run failed");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Check { path } => match load_config(Some(&path)) {
            Ok(config) => {
                println!(
                    "{}: ok ({} cpus, {} x {} byte arrays, {} MB bcache)",
                    path.display(),
                    config.system.cpu_count,
                    config.system.array_count,
                    config.system.array_size_bytes,
                    config.cbox.bcache_size_mb
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                ExitCode::FAILURE
            }
        },
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over the `trace` switch.
fn init_logging(trace: bool) {
    let fallback = if trace { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

/// Reads and validates a configuration file, or returns the defaults.
fn load_config(path: Option<&Path>) -> std::result::Result<Config, String> {
    let config: Config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        }
        None => Config::default(),
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Builds and starts the system, runs the workload, and prints statistics.
fn cmd_run(config: &Config, iterations: u64, json: bool, sections: &[String]) -> Result<()> {
    let allocator = Arc::new(HeapAllocator::new());
    let shared: Arc<dyn BlockAllocator> = allocator.clone();
    let system = System::allocate(config, shared)?;
    let running = system.start()?;

    info!(cpus = running.cpus().len(), iterations, "workload start");
    let workers: Vec<_> = running
        .cpus()
        .iter()
        .cloned()
        .map(|cpu| {
            thread::Builder::new()
                .name(format!("{}-workload", cpu.id()))
                .spawn(move || workload(&cpu, iterations))
        })
        .collect();

    let mut failures = 0;
    for worker in workers {
        match worker.map(thread::JoinHandle::join) {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                error!(error = %e, "workload failed");
                failures += 1;
            }
            Ok(Err(_)) => {
                error!("workload thread panicked");
                failures += 1;
            }
            Err(e) => {
                error!(error = %e, "workload thread did not start");
                failures += 1;
            }
        }
    }

    let (system, stats) = running.shutdown();
    drop(system);
    debug!(live = allocator.live_blocks(), "blocks outstanding after teardown");

    if json {
        match serde_json::to_string_pretty(&stats) {
            Ok(text) => println!("{text}"),
            Err(e) => error!(error = %e, "cannot serialize statistics"),
        }
    } else {
        stats.print_sections(sections);
    }

    if failures > 0 {
        return Err(CoherenceError::InitializationFailure(format!(
            "{failures} workload thread(s) failed"
        )));
    }
    Ok(())
}

/// Retries `f` while the Cbox reports backpressure.
fn retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match f() {
            Err(e) if e.is_backpressure() => thread::yield_now(),
            other => return other,
        }
    }
}

/// One CPU's share of the workload: loads and stores over a small set of shared
/// blocks, with an I/O write and a barrier every few references.
fn workload(cpu: &Cpu, iterations: u64) -> Result<()> {
    let me = cpu.id().0 as u64;
    let io_base = IO_SPACE_BIT | (me * BLOCK_SIZE as u64);
    let mut lost = 0u64;

    for i in 0..iterations {
        let block = (i * 7 + me * 3) % SHARED_BLOCKS;
        let addr = PhysAddr::new(block * BLOCK_SIZE as u64 + (me * 8));

        if i % 3 == 0 {
            let _ = retry(|| cpu.access(MafType::Store(AccessWidth::Quad), addr, &[]))?;
            let value = ((me << 32) | i).to_le_bytes();
            match cpu.store_data(addr, &value) {
                Ok(()) => {}
                // Another CPU took the line between the fill and the write.
                Err(CoherenceError::InvalidRequest(_)) => lost += 1,
                Err(e) => return Err(e),
            }
        } else {
            let _ = retry(|| cpu.access(MafType::Load(AccessWidth::Quad), addr, &[]))?;
        }

        if i % 16 == 15 {
            let word = PhysAddr::new(io_base + (i % 8) * 8);
            let _ = retry(|| cpu.io_write(word, &i.to_le_bytes(), &[]))?;
        }
        if i % 64 == 63 {
            retry(|| cpu.memory_barrier())?;
        }
    }
    retry(|| cpu.memory_barrier())?;

    if lost > 0 {
        warn!(cpu = %cpu.id(), lost, "stores lost their line before writing");
    }
    debug!(cpu = %cpu.id(), "workload done");
    Ok(())
}
