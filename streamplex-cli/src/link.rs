//! In-process link with injectable segment loss and corruption

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use streamplex_core::{BufferSource, Frame, FrameSink, Result, Transport};
use tracing::trace;

/// Fault rates applied to every segment crossing a [`LossyLink`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkFaults {
    /// Probability a segment is silently lost
    pub drop_rate: f64,
    /// Probability one byte of a segment is flipped
    pub corrupt_rate: f64,
}

/// One direction of a link into a peer transport
pub struct LossyLink {
    peer: Arc<Transport>,
    faults: LinkFaults,
    rng: Mutex<StdRng>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
}

impl LossyLink {
    /// Link into `peer`; the same `seed` reproduces the same faults
    pub fn new(peer: Arc<Transport>, faults: LinkFaults, seed: u64) -> Self {
        Self {
            peer,
            faults,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        }
    }

    /// Segments delivered to the peer
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Segments lost on purpose
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Segments delivered with a flipped byte
    pub fn corrupted(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }
}

impl BufferSource for LossyLink {
    /// Segment buffers come straight from the peer's receive pool
    fn accept_req(&self, size: usize, zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        self.peer.accept_req(size, zero_copy, timeout)
    }
}

impl FrameSink for LossyLink {
    fn accept_frame(&self, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        let (lose, flip) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let lose = rng.gen_bool(self.faults.drop_rate);
            let flip = if !lose && !frame.is_empty() && rng.gen_bool(self.faults.corrupt_rate) {
                Some((rng.gen_range(0..frame.payload()), rng.gen_range(1..=255u8)))
            } else {
                None
            };
            (lose, flip)
        };

        if lose {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Link dropped {}-byte segment", frame.payload());
            return Ok(());
        }

        let frame = match flip {
            Some((offset, mask)) => {
                self.corrupted.fetch_add(1, Ordering::Relaxed);
                let mut bytes = frame.to_bytes().to_vec();
                bytes[offset] ^= mask;
                Arc::new(Frame::from_slice(&bytes))
            }
            None => frame,
        };

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.peer.accept_frame(frame, timeout)
    }
}
