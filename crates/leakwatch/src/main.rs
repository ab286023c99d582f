//! leakwatch CLI: inspect and diff process resource snapshots.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use leakwatch_core::config::{Config, LogFormat};
use leakwatch_core::introspect::{ProcIntrospector, TrackedRuntime};
use leakwatch_core::logging::init_logging;
use leakwatch_core::snapshot::{Diff, Snapshot};
use leakwatch_core::tolerance::ToleranceEvaluator;

#[derive(Parser, Debug)]
#[command(name = "lw", version, about = "Process resource leak detection for GUI test runs")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "LW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a snapshot of this process
    Snapshot {
        /// Emit JSON instead of the text report
        #[arg(long)]
        json: bool,
    },

    /// Spawn threads and open a file between two snapshots, then show the diff
    Selfcheck,

    /// Print the diff against the first snapshot at a fixed interval
    Watch {
        /// Delay between snapshots
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Number of diffs to print
        #[arg(long, default_value_t = 10)]
        count: u32,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprint!("{}", err.remediation().render_plain());
                return Err(err)
                    .with_context(|| format!("Failed to load config from {}", path.display()));
            }
        },
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    init_logging(&config.log).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Snapshot { json } => run_snapshot(&config, json),
        Commands::Selfcheck => run_selfcheck(&config),
        Commands::Watch { interval_ms, count } => run_watch(&config, interval_ms, count),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn probe_for(config: &Config) -> ProcIntrospector {
    ProcIntrospector::current().with_filter(config.descriptors.clone())
}

fn run_snapshot(config: &Config, json: bool) -> Result<()> {
    let snapshot = Snapshot::collect(&probe_for(config));
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{snapshot}");
    }
    Ok(())
}

fn run_selfcheck(config: &Config) -> Result<()> {
    let runtime = Arc::new(TrackedRuntime::new());
    let probe = probe_for(config).with_runtime(runtime.clone());
    // each thread parks until its sender is dropped
    let (release_first, parked_first) = mpsc::channel::<()>();
    let (release_second, parked_second) = mpsc::channel::<()>();

    let first = runtime
        .spawn("lw-selfcheck-1", move || {
            let _ = parked_first.recv();
        })
        .context("Failed to spawn first selfcheck thread")?;
    let before = Snapshot::collect(&probe);

    let second = runtime
        .spawn("lw-selfcheck-2", move || {
            let _ = parked_second.recv();
        })
        .context("Failed to spawn second selfcheck thread")?;
    let mut scratch = tempfile::NamedTempFile::new().context("Failed to create temp file")?;
    writeln!(scratch, "leakwatch selfcheck")?;
    let after = Snapshot::collect(&probe);

    let diff = Diff::between(&before, &after);
    let verdict = ToleranceEvaluator::new(config.thresholds.clone()).evaluate(&diff);

    println!("BEFORE:");
    print!("{before}");
    println!("AFTER:");
    print!("{after}");
    println!("DIFF:");
    print!("{diff}");
    println!("Verdict: {verdict}");

    drop(release_first);
    drop(release_second);
    let _ = first.join();
    let _ = second.join();
    Ok(())
}

fn run_watch(config: &Config, interval_ms: u64, count: u32) -> Result<()> {
    let probe = probe_for(config);
    let evaluator = ToleranceEvaluator::new(config.thresholds.clone());
    let first = Snapshot::collect(&probe);
    print!("{first}");

    for i in 1..=count {
        std::thread::sleep(Duration::from_millis(interval_ms));
        let now = Snapshot::collect(&probe);
        let diff = Diff::between(&first, &now);
        println!("--- #{i} ({}) ---", evaluator.evaluate(&diff));
        print!("{diff}");
    }
    Ok(())
}
