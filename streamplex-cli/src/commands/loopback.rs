use crate::link::{LinkFaults, LossyLink};
use crate::writer::FrameLogWriter;
use anyhow::{bail, Context, Result};
use colored::*;
use serde::Serialize;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamplex_core::{BufferSource, Core, Frame, FrameSink, PacketizerConfig, StatsSnapshot};
use tracing::{debug, info};

/// Settings for one loopback run
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// JSON file with a `PacketizerConfig`; missing fields keep defaults
    pub config: Option<String>,
    /// Overrides the configured MTU
    pub mtu: Option<usize>,
    /// Overrides the configured channel count
    pub channels: Option<usize>,
    /// Frames sent on every channel
    pub frames: usize,
    /// Payload bytes per frame
    pub size: usize,
    /// Build frames from transport buffers
    pub zero_copy: bool,
    /// Link fault rates
    pub faults: LinkFaults,
    /// Seed for the link fault generator
    pub seed: u64,
    /// Frame log for delivered frames
    pub log: Option<String>,
    /// Split the frame log at this many bytes (0 = single file)
    pub log_limit: u64,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            config: None,
            mtu: None,
            channels: None,
            frames: 100,
            size: 4096,
            zero_copy: false,
            faults: LinkFaults::default(),
            seed: 0,
            log: None,
            log_limit: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LinkReport {
    pub forwarded: u64,
    pub dropped: u64,
    pub corrupted: u64,
}

#[derive(Debug, Serialize)]
pub struct LoopbackReport {
    pub config: PacketizerConfig,
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_mismatched: u64,
    pub frames_lost: u64,
    pub frames_logged: Option<u64>,
    pub elapsed_ms: u128,
    pub link: LinkReport,
    pub tx: StatsSnapshot,
    pub rx: StatsSnapshot,
}

/// Receiving application that checks every payload against the pattern
struct Checker {
    channel: u8,
    size: usize,
    good: AtomicU64,
    bad: AtomicU64,
}

impl BufferSource for Checker {}

impl FrameSink for Checker {
    fn accept_frame(
        &self,
        frame: Arc<Frame>,
        _timeout: Option<Duration>,
    ) -> streamplex_core::Result<()> {
        let bytes = frame.to_bytes();
        let intact = bytes.len() == self.size
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| *b == pattern(self.channel, i));
        if intact {
            self.good.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(
                "Channel {} delivered a damaged {}-byte frame",
                self.channel,
                bytes.len()
            );
            self.bad.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn pattern(channel: u8, index: usize) -> u8 {
    (channel as usize * 131 + index) as u8
}

fn load_config(options: &LoopbackOptions) -> Result<PacketizerConfig> {
    let mut config = match &options.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config file: {}", path))?
        }
        None => PacketizerConfig::default(),
    };

    if let Some(mtu) = options.mtu {
        config.mtu = mtu;
    }
    if let Some(channels) = options.channels {
        config.channels = channels;
    }
    config.validate().context("Invalid packetizer configuration")?;
    Ok(config)
}

/// Push frames through two cores joined by a lossy link
pub fn run(options: &LoopbackOptions) -> Result<LoopbackReport> {
    for rate in [options.faults.drop_rate, options.faults.corrupt_rate] {
        if !(0.0..=1.0).contains(&rate) {
            bail!("Fault rate {} outside 0.0..=1.0", rate);
        }
    }

    let config = load_config(options)?;
    info!(
        "Loopback: {} channels, MTU {}, {} x {} bytes per channel",
        config.channels, config.mtu, options.frames, options.size
    );

    let tx = Core::new(config.clone()).context("Failed to build sending core")?;
    let rx = Core::new(config.clone()).context("Failed to build receiving core")?;

    let forward = Arc::new(LossyLink::new(rx.transport(), options.faults, options.seed));
    let reverse = Arc::new(LossyLink::new(
        tx.transport(),
        options.faults,
        options.seed.wrapping_add(1),
    ));
    tx.transport().set_slave(forward.clone());
    rx.transport().set_slave(reverse);

    let writer = match &options.log {
        Some(path) => Some(FrameLogWriter::create(path, options.log_limit)?),
        None => None,
    };

    let mut checkers = Vec::with_capacity(config.channels);
    for app in rx.applications() {
        let checker = Arc::new(Checker {
            channel: app.channel(),
            size: options.size,
            good: AtomicU64::new(0),
            bad: AtomicU64::new(0),
        });
        app.set_slave(checker.clone());
        if let Some(writer) = &writer {
            app.add_slave(writer.channel(app.channel()));
        }
        checkers.push(checker);
    }

    let payloads: Vec<Vec<u8>> = tx
        .applications()
        .iter()
        .map(|app| (0..options.size).map(|i| pattern(app.channel(), i)).collect())
        .collect();

    let started = Instant::now();
    let mut sent = 0u64;
    for _ in 0..options.frames {
        for (app, payload) in tx.applications().iter().zip(&payloads) {
            let mut frame = app
                .accept_req(options.size, options.zero_copy, None)
                .with_context(|| format!("Failed to allocate frame on channel {}", app.channel()))?;
            frame.write_at(0, payload);
            app.accept_frame(Arc::new(frame), None)
                .with_context(|| format!("Failed to send frame on channel {}", app.channel()))?;
            sent += 1;
        }
    }
    let elapsed = started.elapsed();

    let frames_logged = match writer {
        Some(writer) => {
            writer.close()?;
            Some(writer.frame_count())
        }
        None => None,
    };

    let delivered: u64 = checkers.iter().map(|c| c.good.load(Ordering::Relaxed)).sum();
    let mismatched: u64 = checkers.iter().map(|c| c.bad.load(Ordering::Relaxed)).sum();

    let report = LoopbackReport {
        config,
        frames_sent: sent,
        frames_delivered: delivered,
        frames_mismatched: mismatched,
        frames_lost: sent.saturating_sub(delivered + mismatched),
        frames_logged,
        elapsed_ms: elapsed.as_millis(),
        link: LinkReport {
            forwarded: forward.forwarded(),
            dropped: forward.dropped(),
            corrupted: forward.corrupted(),
        },
        tx: tx.stats(),
        rx: rx.stats(),
    };

    tx.close();
    rx.close();
    Ok(report)
}

pub fn execute(options: &LoopbackOptions, json: bool) -> Result<()> {
    let report = run(options)?;

    if json {
        let text = serde_json::to_string_pretty(&report)
            .with_context(|| "Failed to serialize loopback report")?;
        println!("{}", text);
        return Ok(());
    }

    println!("\n=== Loopback Results ===");
    println!("Frames sent:        {}", report.frames_sent);
    println!(
        "Frames delivered:   {}",
        report.frames_delivered.to_string().green()
    );
    if report.frames_mismatched > 0 {
        println!(
            "Frames damaged:     {}",
            report.frames_mismatched.to_string().red()
        );
    }
    if report.frames_lost > 0 {
        println!("Frames lost:        {}", report.frames_lost.to_string().red());
    }
    if let Some(logged) = report.frames_logged {
        println!("Frames logged:      {}", logged);
    }
    println!("Elapsed:            {} ms", report.elapsed_ms);
    println!();

    println!("=== Link ===");
    println!("Segments forwarded: {}", report.link.forwarded);
    println!("Segments dropped:   {}", report.link.dropped);
    println!("Segments corrupted: {}", report.link.corrupted);
    println!();

    println!("=== Receiver ===");
    println!("Segments received:  {}", report.rx.segments_received);
    println!("Integrity failures: {}", report.rx.integrity_failures);
    println!("Sequence errors:    {}", report.rx.sequence_errors);
    println!("Protocol errors:    {}", report.rx.protocol_violations);
    println!("Timeouts:           {}", report.rx.timeouts);
    println!("Dropped frames:     {}", report.rx.dropped_frames);
    println!();

    if report.frames_delivered == report.frames_sent {
        println!("{} Every frame delivered intact", "✓".green());
    } else {
        println!(
            "{} {} of {} frames did not arrive intact",
            "✗".red(),
            report.frames_sent - report.frames_delivered,
            report.frames_sent
        );
    }

    Ok(())
}
