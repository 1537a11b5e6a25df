//! # Streamplex Core
//!
//! Zero-copy frame streaming and a packetizer that multiplexes virtual
//! channels over one fixed-MTU transport.
//!
//! ## Modules
//!
//! - `buffer`: Raw memory blocks with header-room accounting
//! - `frame`: Multi-buffer frames and their read/write cursors
//! - `stream`: Master/Slave push-and-allocate protocol
//! - `pool`: Bounded, blocking buffer pool
//! - `queue`: Bounded frame queue with a forwarding worker
//! - `segment`: Segment wire format
//! - `controller`: Segmentation and reassembly engine
//! - `adapter`: Transport and per-channel endpoints
//! - `packetizer`: Core composition root
//! - `framelog`: Persisted frame-log record format
//! - `config`, `constants`, `error`: Settings, limits and error types
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use streamplex_core::{connect, Core, Frame, FrameSink, PacketizerConfig};
//!
//! let left = Core::new(PacketizerConfig::default()).unwrap();
//! let right = Core::new(PacketizerConfig::default()).unwrap();
//! connect(&left, &right);
//!
//! let app = left.application(0).unwrap();
//! app.accept_frame(Arc::new(Frame::from_slice(b"hello")), None).unwrap();
//! assert_eq!(right.stats().frames_delivered, 1);
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod controller;
mod deadline;
pub mod error;
pub mod frame;
pub mod framelog;
pub mod packetizer;
pub mod pool;
pub mod queue;
pub mod segment;
pub mod stream;

// Re-export commonly used types
pub use adapter::{Application, Transport};
pub use buffer::{Buffer, BufferOwner};
pub use config::{PacketizerConfig, PoolConfig};
pub use constants::IntegrityCheck;
pub use controller::{ChannelState, Controller, StatsSnapshot};
pub use error::StreamError;
pub use frame::Frame;
pub use packetizer::{connect, Core};
pub use pool::Pool;
pub use queue::FrameQueue;
pub use stream::{BufferSource, FrameSink, Master, Slave};

/// Result type alias for stream operations
pub type Result<T> = core::result::Result<T, StreamError>;
