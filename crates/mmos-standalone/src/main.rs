//! Standalone MMOS device binary.
//!
//! Reads console commands from a script file or stdin and prints the
//! device's replies to stdout.

use std::{
    fs::File,
    io::{self, BufReader},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use mmos_core::{KernelConfig, layout::FileLayoutStore};
use mmos_standalone::Console;

#[derive(Debug, Parser)]
#[command(name = "mmos-standalone", about = "Run one MMOS device without a server")]
struct Args {
    /// Layout file, created on first shutdown
    #[arg(long, default_value = "mmos-layout.json")]
    layout: PathBuf,

    /// Command script; stdin when omitted
    #[arg(long)]
    script: Option<PathBuf>,

    /// Simulated time per tick in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// TTL stamped on new packets
    #[arg(long, default_value_t = 8)]
    ttl: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config =
        KernelConfig { home_app: Some(mmos_apps::LAUNCHER.to_string()), ..KernelConfig::default() };
    config.network.default_ttl = args.ttl;

    let store = Box::new(FileLayoutStore::new(&args.layout));
    let mut console = Console::boot(store, config, Duration::from_millis(args.tick_ms))?;

    let mut stdout = io::stdout().lock();
    match &args.script {
        Some(path) => console.run_script(BufReader::new(File::open(path)?), &mut stdout)?,
        None => console.run_script(io::stdin().lock(), &mut stdout)?,
    }

    console.shutdown()?;
    Ok(())
}
