use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use frame_relay::{RelayConfig, config::RelayCliArgs};
use video_ingest::DecodePath;

#[derive(Parser)]
#[command(name = "frame-relay", version, about = "Relay a live camera feed to many subscribers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until Ctrl+C.
    Serve(RelayCliArgs),
    /// Try every decoder against the source and report which ones work.
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ProbeArgs {
    #[arg(long = "source", env = "RTSP_URL", value_name = "URI")]
    source_uri: String,
    #[arg(long = "width", default_value_t = 1280)]
    width: u32,
    #[arg(long = "height", default_value_t = 720)]
    height: u32,
    #[arg(long = "read-timeout-ms", default_value_t = 5000)]
    read_timeout_ms: u64,
    /// Longest to wait for each decoder's first frame.
    #[arg(long = "open-timeout-ms", default_value_t = 10_000)]
    open_timeout_ms: u64,
    #[arg(
        long = "decoders",
        value_delimiter = ',',
        default_value = "nvdec,hwaccel,software"
    )]
    decoders: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => frame_relay::run(RelayConfig::try_from(args)?),
        Command::Probe(args) => probe(args),
    }
}

fn probe(args: ProbeArgs) -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let decoders = args
        .decoders
        .iter()
        .map(|name| DecodePath::parse(name).ok_or_else(|| anyhow!("Unrecognised decoder {name:?}")))
        .collect::<Result<Vec<_>>>()?;
    let acquirer = video_ingest::ffmpeg_acquirer(
        &decoders,
        (args.width, args.height),
        Duration::from_millis(args.read_timeout_ms),
        Duration::from_millis(args.open_timeout_ms),
    );

    println!("Probing {}", args.source_uri);
    let report = acquirer.probe(&args.source_uri);
    for entry in &report {
        match &entry.outcome {
            Ok((width, height)) => println!("  {:<10} ok ({width}x{height})", entry.strategy),
            Err(err) => println!("  {:<10} failed: {err}", entry.strategy),
        }
    }
    if report.iter().all(|entry| entry.outcome.is_err()) {
        bail!("no decoder could read {}", args.source_uri);
    }
    Ok(())
}
