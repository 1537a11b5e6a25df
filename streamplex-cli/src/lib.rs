//! Library entry for streamplex-cli used by integration tests and embedding.

pub mod commands;
pub mod link;
pub mod writer;

// Re-export commands for convenience
pub use commands::*;

pub use link::{LinkFaults, LossyLink};
pub use writer::{ChannelPort, FrameLogWriter};
