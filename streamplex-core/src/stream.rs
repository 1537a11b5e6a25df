//! Master/Slave push-and-allocate protocol
//!
//! A [`Master`] asks its primary slave for buffers and pushes completed
//! frames to every registered slave. Slaves implement two capabilities:
//! [`BufferSource`] (allocate) and [`FrameSink`] (accept). A frame handed to
//! more than one slave is shared through `Arc` and is read-only from then on.

use crate::deadline::Deadline;
use crate::frame::Frame;
use crate::Result;
use core::time::Duration;
use std::sync::{Arc, PoisonError, RwLock};

#[cfg(feature = "logging")]
use tracing::debug;

/// Allocation capability of a slave
pub trait BufferSource: Send + Sync {
    /// Allocate a frame with room for at least `size` payload bytes
    ///
    /// `zero_copy` allows buffers laid out for in-place use downstream.
    /// `timeout` of `None` blocks until satisfied or the source is closed.
    /// The default allocates unpooled heap memory.
    fn accept_req(&self, size: usize, zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        let _ = (zero_copy, timeout);
        Ok(Frame::with_capacity(size))
    }
}

/// Frame-accepting capability of a slave
pub trait FrameSink: Send + Sync {
    /// Take a completed frame
    ///
    /// Faults in the data are reported through the frame's error word, never
    /// through the return value. `Err` means the frame was not taken:
    /// `Timeout` for backpressure, `TransportClosed` after close.
    fn accept_frame(&self, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()>;
}

/// A component that can both allocate and accept frames
pub trait Slave: BufferSource + FrameSink {}

impl<T: BufferSource + FrameSink + ?Sized> Slave for T {}

#[derive(Default)]
struct Subscribers {
    primary: Option<Arc<dyn Slave>>,
    secondary: Vec<Arc<dyn FrameSink>>,
}

/// Pushes frames into one primary and any number of secondary slaves
///
/// Registration is meant to happen before traffic starts; a send that is
/// already in flight keeps delivering to the slave set it started with.
#[derive(Default)]
pub struct Master {
    subscribers: RwLock<Subscribers>,
}

impl Master {
    /// Create a master with no slaves
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary slave, used for buffer requests and frame delivery
    pub fn set_slave<S: Slave + 'static>(&self, slave: Arc<S>) {
        let slave: Arc<dyn Slave> = slave;
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .primary = Some(slave);
    }

    /// Add a secondary slave that receives every frame
    pub fn add_slave<S: FrameSink + 'static>(&self, slave: Arc<S>) {
        let slave: Arc<dyn FrameSink> = slave;
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .secondary
            .push(slave);
    }

    /// Drop every registered slave
    pub fn clear_slaves(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.primary = None;
        subscribers.secondary.clear();
    }

    /// Number of registered slaves, primary included
    pub fn slave_count(&self) -> usize {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.secondary.len() + usize::from(subscribers.primary.is_some())
    }

    /// Request a frame of at least `size` bytes from the primary slave
    ///
    /// Without a primary slave the frame comes from unpooled heap memory.
    pub fn request_frame(
        &self,
        size: usize,
        zero_copy: bool,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        let primary = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .primary
            .clone();
        match primary {
            Some(slave) => slave.accept_req(size, zero_copy, timeout),
            None => Ok(Frame::with_capacity(size)),
        }
    }

    /// Push `frame` to every slave within `timeout`
    ///
    /// Secondary slaves are served first and the primary last, so a frame
    /// with a single subscriber arrives uniquely owned. Every slave is tried;
    /// the first failure is returned. `Err(Timeout)` signals backpressure.
    pub fn send_frame(&self, frame: impl Into<Arc<Frame>>, timeout: Option<Duration>) -> Result<()> {
        let frame = frame.into();
        let deadline = Deadline::after(timeout);
        let (primary, secondary) = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            (subscribers.primary.clone(), subscribers.secondary.clone())
        };

        if primary.is_none() && secondary.is_empty() {
            #[cfg(feature = "logging")]
            debug!("Dropping {}-byte frame: no slaves attached", frame.payload());
            return Ok(());
        }

        let mut outcome = Ok(());
        let mut record = |result: Result<()>| {
            if outcome.is_ok() {
                outcome = result;
            }
        };

        let (last, rest) = match &primary {
            Some(_) => (None, &secondary[..]),
            None => match secondary.split_last() {
                Some((last, rest)) => (Some(last), rest),
                None => (None, &secondary[..]),
            },
        };

        for sink in rest {
            record(
                deadline
                    .remaining()
                    .and_then(|left| sink.accept_frame(frame.clone(), left)),
            );
        }

        match (primary, last) {
            (Some(slave), _) => record(
                deadline
                    .remaining()
                    .and_then(|left| slave.accept_frame(frame, left)),
            ),
            (None, Some(sink)) => record(
                deadline
                    .remaining()
                    .and_then(|left| sink.accept_frame(frame, left)),
            ),
            (None, None) => {}
        }

        outcome
    }
}
