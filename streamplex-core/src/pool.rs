//! Bounded buffer pool shared by every master drawing from one slave

use crate::buffer::{Buffer, BufferOwner};
use crate::config::PoolConfig;
use crate::deadline::Deadline;
use crate::error::StreamError;
use crate::frame::Frame;
use crate::stream::BufferSource;
use crate::Result;
use core::time::Duration;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "logging")]
use tracing::{debug, info};

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    allocated: u64,
    closed: bool,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferOwner for PoolShared {
    fn return_buffer(&self, data: Vec<u8>) {
        let mut state = self.lock();
        state.outstanding -= 1;
        if !state.closed && state.free.len() < self.config.cache_limit {
            state.free.push(data);
        }
        drop(state);
        self.returned.notify_all();
    }
}

/// Fixed-size buffer allocator with an optional bound on outstanding buffers
///
/// Allocation and return are serialized internally; callers block (up to
/// their timeout) while the bound is reached. Closing the pool wakes every
/// waiter with `TransportClosed`. Buffers already handed out stay valid and
/// still come back here when dropped.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                    allocated: 0,
                    closed: false,
                }),
                returned: Condvar::new(),
            }),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Take one buffer, waiting up to `timeout` while the pool is exhausted
    pub fn request_buffer(&self, timeout: Option<Duration>) -> Result<Buffer> {
        let mut buffers = self.take(1, timeout)?;
        buffers
            .pop()
            .ok_or_else(|| StreamError::AllocationFailure("empty reservation".to_string()))
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }

    /// Buffers handed out since creation
    pub fn allocated(&self) -> u64 {
        self.shared.lock().allocated
    }

    /// Released buffers cached for reuse
    pub fn cached(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// True once [`Pool::close`] has run
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Refuse further requests and wake every blocked caller
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.free.clear();
        drop(state);
        self.shared.returned.notify_all();

        #[cfg(feature = "logging")]
        info!("Buffer pool closed");
    }

    /// Reserve `count` buffers as one unit so concurrent multi-buffer
    /// requests never hold partial sets while waiting
    fn take(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<Buffer>> {
        let deadline = Deadline::after(timeout);
        let max = self.shared.config.max_buffers;
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(StreamError::TransportClosed);
            }
            if max == 0 || state.outstanding + count <= max {
                break;
            }
            state = deadline.wait(&self.shared.returned, state)?;
        }
        state.outstanding += count;
        state.allocated += count as u64;
        let reuse = count.min(state.free.len());
        let split = state.free.len() - reuse;
        let mut blocks = state.free.split_off(split);
        drop(state);

        let size = self.shared.config.buffer_size;
        blocks.resize_with(count, || vec![0u8; size]);
        Ok(blocks.into_iter().map(|data| self.wrap(data)).collect())
    }

    fn wrap(&self, data: Vec<u8>) -> Buffer {
        let owner: Arc<dyn BufferOwner> = self.shared.clone();
        Buffer::with_owner(data, owner)
    }
}

impl BufferSource for Pool {
    /// Allocate enough pool buffers to hold `size` bytes (at least one)
    ///
    /// Pool buffers are always written in place, so `zero_copy` has no effect.
    fn accept_req(&self, size: usize, _zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        let count = size.div_ceil(self.shared.config.buffer_size).max(1);
        let max = self.shared.config.max_buffers;
        if max != 0 && count > max {
            return Err(StreamError::AllocationFailure(format!(
                "{} bytes needs {} buffers, pool holds at most {}",
                size, count, max
            )));
        }

        let buffers = self.take(count, timeout)?;

        #[cfg(feature = "logging")]
        debug!("Allocated {} pool buffers for {} bytes", count, size);

        Ok(Frame::from_buffers(buffers))
    }
}
