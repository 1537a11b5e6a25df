use anyhow::{Context, Result};
use bytes::BytesMut;
use colored::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use streamplex_core::framelog::decode_record;
use tracing::{info, warn};

/// Payload bytes shown per record in the hex preview
const PREVIEW_LEN: usize = 16;

#[derive(Debug, Serialize)]
pub struct RecordSummary {
    pub offset: usize,
    pub channel: u8,
    pub flags: u32,
    pub payload_len: usize,
    pub preview: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ChannelSummary {
    pub records: u64,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct LogSummary {
    pub file_size: usize,
    pub records: Vec<RecordSummary>,
    pub channels: BTreeMap<u8, ChannelSummary>,
    /// Bytes after the last complete record
    pub trailing_bytes: usize,
}

/// Walk every record in a frame-log image
pub fn summarize(data: &[u8]) -> Result<LogSummary> {
    let mut buf = BytesMut::from(data);
    let mut records = Vec::new();
    let mut channels: BTreeMap<u8, ChannelSummary> = BTreeMap::new();
    let mut offset = 0;

    while let Some(record) = decode_record(&mut buf, data.len())
        .with_context(|| format!("Malformed record at offset {}", offset))?
    {
        let entry = channels.entry(record.channel).or_default();
        entry.records += 1;
        entry.bytes += record.payload.len() as u64;

        let preview_len = record.payload.len().min(PREVIEW_LEN);
        records.push(RecordSummary {
            offset,
            channel: record.channel,
            flags: record.flags,
            payload_len: record.payload.len(),
            preview: hex::encode(&record.payload[..preview_len]),
        });
        offset += record.wire_size();
    }

    Ok(LogSummary {
        file_size: data.len(),
        records,
        channels,
        trailing_bytes: buf.len(),
    })
}

pub fn execute(input: &str, json: bool, records: bool) -> Result<()> {
    info!("Inspecting frame log: {}", input);

    let data =
        fs::read(input).with_context(|| format!("Failed to read input file: {}", input))?;
    let summary = summarize(&data)?;

    if summary.trailing_bytes > 0 {
        warn!(
            "{} trailing bytes do not form a complete record",
            summary.trailing_bytes
        );
    }

    if json {
        let text = serde_json::to_string_pretty(&summary)
            .with_context(|| "Failed to serialize log summary")?;
        println!("{}", text);
        return Ok(());
    }

    println!("\n=== Frame Log ===");
    println!("File size:      {} bytes", summary.file_size);
    println!("Records:        {}", summary.records.len());
    println!("Channels:       {}", summary.channels.len());
    if summary.trailing_bytes > 0 {
        println!(
            "Trailing bytes: {}",
            summary.trailing_bytes.to_string().red()
        );
    }
    println!();

    if records {
        println!("=== Records ===");
        for record in &summary.records {
            println!(
                "@{:<8} ch {:>3}  flags {:06x}  {:>8} bytes  {}",
                record.offset, record.channel, record.flags, record.payload_len, record.preview
            );
        }
        println!();
    }

    println!("=== Channels ===");
    for (channel, stats) in &summary.channels {
        println!(
            "Channel {:>3}: {} records, {} bytes",
            channel, stats.records, stats.bytes
        );
    }
    println!();

    if summary.trailing_bytes == 0 {
        println!("{} Log ends on a record boundary", "✓".green());
    } else {
        println!("{} Log ends with a partial record", "✗".red());
    }

    Ok(())
}
