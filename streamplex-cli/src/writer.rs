//! Frame-log file writer
//!
//! Each channel gets its own [`ChannelPort`] slave; all ports share one
//! buffered output. With a size limit the log is split across `name.1`,
//! `name.2`, ... and a record never straddles two files.

use anyhow::{bail, Context};
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use streamplex_core::constants::LOG_RECORD_HEADER_SIZE;
use streamplex_core::framelog::encode_frame_record;
use streamplex_core::{BufferSource, Frame, FrameSink, StreamError};
use tracing::{debug, info};

/// Write buffer in front of the log file
const WRITE_BUFFER: usize = 64 * 1024;

struct WriterState {
    out: Option<BufWriter<File>>,
    base: PathBuf,
    size_limit: u64,
    index: u32,
    file_size: u64,
    total_size: u64,
    frames: u64,
    scratch: BytesMut,
}

impl WriterState {
    fn path_for(&self, index: u32) -> PathBuf {
        if self.size_limit == 0 {
            return self.base.clone();
        }
        let mut name = self.base.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn open(&mut self) -> std::io::Result<()> {
        let path = self.path_for(self.index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file_size = file.metadata()?.len();
        self.out = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
        debug!("Frame log file opened: {}", path.display());
        Ok(())
    }

    fn write_record(&mut self, channel: u8, frame: &Frame) -> Result<(), StreamError> {
        if self.out.is_none() {
            return Err(StreamError::TransportClosed);
        }

        self.scratch.clear();
        encode_frame_record(channel, frame, &mut self.scratch)?;
        let len = self.scratch.len() as u64;

        if self.size_limit != 0 {
            if len > self.size_limit {
                return Err(StreamError::ProtocolViolation(format!(
                    "{}-byte record exceeds the {}-byte file limit",
                    len, self.size_limit
                )));
            }
            if self.file_size + len > self.size_limit {
                if let Some(mut out) = self.out.take() {
                    out.flush()?;
                }
                self.index += 1;
                self.open()?;
            }
        }

        if let Some(out) = self.out.as_mut() {
            out.write_all(&self.scratch)?;
        }
        self.file_size += len;
        self.total_size += len;
        self.frames += 1;
        Ok(())
    }
}

/// Shared frame-log output
pub struct FrameLogWriter {
    state: Arc<Mutex<WriterState>>,
}

impl FrameLogWriter {
    /// Open `path` for appending; `size_limit` of 0 disables splitting
    pub fn create(path: impl AsRef<Path>, size_limit: u64) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if size_limit != 0 && size_limit < LOG_RECORD_HEADER_SIZE as u64 {
            bail!("File size limit {} cannot hold any record", size_limit);
        }

        let mut state = WriterState {
            out: None,
            base: path.to_path_buf(),
            size_limit,
            index: 1,
            file_size: 0,
            total_size: 0,
            frames: 0,
            scratch: BytesMut::new(),
        };
        state
            .open()
            .with_context(|| format!("Failed to open frame log: {}", path.display()))?;

        info!("Logging frames to {}", path.display());
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slave that logs every frame it receives as `channel`
    pub fn channel(&self, channel: u8) -> Arc<ChannelPort> {
        Arc::new(ChannelPort {
            channel,
            state: self.state.clone(),
        })
    }

    /// Records written so far
    pub fn frame_count(&self) -> u64 {
        self.lock().frames
    }

    /// Bytes written across all files
    pub fn total_size(&self) -> u64 {
        self.lock().total_size
    }

    /// Path of the file currently written
    pub fn current_path(&self) -> PathBuf {
        let state = self.lock();
        state.path_for(state.index)
    }

    /// Flush buffered records to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        if let Some(out) = self.lock().out.as_mut() {
            out.flush().context("Failed to flush frame log")?;
        }
        Ok(())
    }

    /// Flush and close; ports refuse frames afterwards
    pub fn close(&self) -> anyhow::Result<()> {
        let out = self.lock().out.take();
        if let Some(mut out) = out {
            out.flush().context("Failed to flush frame log")?;
        }
        Ok(())
    }
}

/// Per-channel slave of a [`FrameLogWriter`]
pub struct ChannelPort {
    channel: u8,
    state: Arc<Mutex<WriterState>>,
}

impl BufferSource for ChannelPort {}

impl FrameSink for ChannelPort {
    fn accept_frame(
        &self,
        frame: Arc<Frame>,
        _timeout: Option<Duration>,
    ) -> streamplex_core::Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_record(self.channel, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamplex_core::framelog::decode_record;
    use tempfile::tempdir;

    fn read_records(path: &Path) -> Vec<(u8, Vec<u8>)> {
        let mut buf = BytesMut::from(&std::fs::read(path).unwrap()[..]);
        let mut out = Vec::new();
        while let Some(record) = decode_record(&mut buf, 1 << 20).unwrap() {
            out.push((record.channel, record.payload.to_vec()));
        }
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn test_records_per_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.dat");
        let writer = FrameLogWriter::create(&path, 0).unwrap();

        writer
            .channel(1)
            .accept_frame(Arc::new(Frame::from_slice(b"one")), None)
            .unwrap();
        writer
            .channel(7)
            .accept_frame(Arc::new(Frame::from_slice(b"seven")), None)
            .unwrap();
        writer.close().unwrap();

        assert_eq!(writer.frame_count(), 2);
        assert_eq!(
            read_records(&path),
            vec![(1, b"one".to_vec()), (7, b"seven".to_vec())]
        );
    }

    #[test]
    fn test_split_at_size_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("split.dat");
        // Two 18-byte records fit per file
        let writer = FrameLogWriter::create(&path, 40).unwrap();
        let port = writer.channel(0);
        for i in 0..5u8 {
            port.accept_frame(Arc::new(Frame::from_slice(&[i; 10])), None)
                .unwrap();
        }
        writer.close().unwrap();

        let first = read_records(&dir.path().join("split.dat.1"));
        let second = read_records(&dir.path().join("split.dat.2"));
        let third = read_records(&dir.path().join("split.dat.3"));
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].1, vec![4u8; 10]);
        assert_eq!(writer.total_size(), 5 * 18);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = tempdir().unwrap();
        let writer = FrameLogWriter::create(dir.path().join("small.dat"), 16).unwrap();
        let result = writer
            .channel(0)
            .accept_frame(Arc::new(Frame::from_slice(&[0u8; 32])), None);
        assert!(matches!(result, Err(StreamError::ProtocolViolation(_))));
    }

    #[test]
    fn test_closed_writer_refuses_frames() {
        let dir = tempdir().unwrap();
        let writer = FrameLogWriter::create(dir.path().join("closed.dat"), 0).unwrap();
        let port = writer.channel(2);
        writer.close().unwrap();
        assert_eq!(
            port.accept_frame(Arc::new(Frame::new()), None),
            Err(StreamError::TransportClosed)
        );
    }
}
