use anyhow::Result;
use clap::{Parser, Subcommand};
use streamplex_cli::commands;
use streamplex_cli::commands::loopback::LoopbackOptions;
use streamplex_cli::link::LinkFaults;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "streamplex")]
#[command(about = "Streamplex - Virtual channels over a fixed-MTU frame stream", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run frames through two packetizers joined back to back
    Loopback {
        /// JSON packetizer configuration
        #[arg(short, long)]
        config: Option<String>,

        /// Link MTU (overrides the configuration)
        #[arg(long)]
        mtu: Option<usize>,

        /// Number of channels (overrides the configuration)
        #[arg(long)]
        channels: Option<usize>,

        /// Frames sent per channel
        #[arg(short, long, default_value = "100")]
        frames: usize,

        /// Payload bytes per frame
        #[arg(short, long, default_value = "4096")]
        size: usize,

        /// Build frames from transport buffers
        #[arg(long)]
        zero_copy: bool,

        /// Probability of losing a segment
        #[arg(long, default_value = "0.0")]
        drop_rate: f64,

        /// Probability of flipping a byte in a segment
        #[arg(long, default_value = "0.0")]
        corrupt_rate: f64,

        /// Seed for link faults
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Log delivered frames to this file
        #[arg(long)]
        log: Option<String>,

        /// Split the frame log at this many bytes
        #[arg(long, default_value = "0")]
        log_limit: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize a frame-log file
    Inspect {
        /// Frame-log file
        #[arg(short, long)]
        input: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// List every record
        #[arg(long)]
        records: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Execute command
    match cli.command {
        Commands::Loopback {
            config,
            mtu,
            channels,
            frames,
            size,
            zero_copy,
            drop_rate,
            corrupt_rate,
            seed,
            log,
            log_limit,
            json,
        } => {
            let options = LoopbackOptions {
                config,
                mtu,
                channels,
                frames,
                size,
                zero_copy,
                faults: LinkFaults {
                    drop_rate,
                    corrupt_rate,
                },
                seed,
                log,
                log_limit,
            };
            commands::loopback::execute(&options, json)
        }

        Commands::Inspect {
            input,
            json,
            records,
        } => commands::inspect::execute(&input, json, records),
    }
}
