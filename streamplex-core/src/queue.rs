//! Bounded frame queue drained by a worker thread
//!
//! ```text
//! producer ─┐
//! producer ─┼─► FrameQueue (bounded) ─► worker ─► Master ─► slaves
//! producer ─┘
//! ```
//!
//! Producers see backpressure as `Err(Timeout)` once the queue is full.
//! Closing the queue fails every parked producer with `TransportClosed`;
//! frames already queued are still forwarded before the worker exits.

use crate::deadline::Deadline;
use crate::error::StreamError;
use crate::frame::Frame;
use crate::stream::{BufferSource, FrameSink, Master};
use crate::Result;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[cfg(feature = "logging")]
use tracing::{debug, info, warn};

struct QueueState {
    frames: VecDeque<Arc<Frame>>,
    closed: bool,
}

struct QueueShared {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next frame to forward, `None` once closed and drained
    fn next(&self) -> Option<Arc<Frame>> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A `Slave` that decouples producers from downstream processing
pub struct FrameQueue {
    shared: Arc<QueueShared>,
    master: Arc<Master>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameQueue {
    /// Start a queue holding at most `capacity` frames
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "Queue capacity must be non-zero".to_string(),
            ));
        }

        let shared = Arc::new(QueueShared {
            capacity,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let master = Arc::new(Master::new());

        let worker = {
            let shared = shared.clone();
            let master = master.clone();
            thread::Builder::new()
                .name("streamplex-queue".to_string())
                .spawn(move || run_worker(&shared, &master))?
        };

        Ok(Self {
            shared,
            master,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Master the worker pushes into; attach downstream slaves here
    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    /// Frames waiting for the worker
    pub fn len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    /// True when no frame is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames handed downstream so far
    pub fn forwarded(&self) -> u64 {
        self.shared.forwarded.load(Ordering::Relaxed)
    }

    /// Frames downstream refused
    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting frames, drain the queue and join the worker
    ///
    /// Safe to call more than once, and from the worker's own downstream
    /// callbacks (the join is skipped there).
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                state.closed = true;

                #[cfg(feature = "logging")]
                info!("Closing frame queue ({} frames pending)", state.frames.len());
            }
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                #[cfg(feature = "logging")]
                warn!("Frame queue worker panicked");
            }
        }
    }
}

fn run_worker(shared: &QueueShared, master: &Master) {
    while let Some(frame) = shared.next() {
        match master.send_frame(frame, None) {
            Ok(()) => {
                shared.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "logging")]
                warn!("Queue worker could not forward frame: {}", _e);
            }
        }
    }

    #[cfg(feature = "logging")]
    debug!("Frame queue worker exiting");
}

impl BufferSource for FrameQueue {
    fn accept_req(&self, size: usize, zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        self.master.request_frame(size, zero_copy, timeout)
    }
}

impl FrameSink for FrameQueue {
    fn accept_frame(&self, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(StreamError::TransportClosed);
            }
            if state.frames.len() < self.shared.capacity {
                break;
            }
            state = deadline.wait(&self.shared.not_full, state)?;
        }
        state.frames.push_back(frame);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.close();
    }
}
