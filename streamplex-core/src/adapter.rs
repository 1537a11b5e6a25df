//! Stream endpoints binding the controller to the outside world
//!
//! [`Transport`] faces the physical link: segments written to it are
//! reassembled, segments the controller produces leave through its master.
//! [`Application`] faces one virtual channel: frames written to it are
//! segmented, reassembled frames leave through its master.

use crate::controller::Controller;
use crate::frame::Frame;
use crate::stream::{BufferSource, FrameSink, Master, Slave};
use crate::Result;
use core::time::Duration;
use std::sync::Arc;

/// Link-side endpoint of a core
pub struct Transport {
    controller: Arc<Controller>,
    master: Arc<Master>,
}

impl Transport {
    pub(crate) fn new(controller: Arc<Controller>, master: Arc<Master>) -> Self {
        Self { controller, master }
    }

    /// Master carrying outbound segments
    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    /// Attach the link's sending side; it also supplies segment buffers
    pub fn set_slave<S: Slave + 'static>(&self, slave: Arc<S>) {
        self.master.set_slave(slave);
    }

    /// Attach an additional observer of outbound segments
    pub fn add_slave<S: FrameSink + 'static>(&self, slave: Arc<S>) {
        self.master.add_slave(slave);
    }

    /// Request a segment frame from the link
    pub fn request_frame(
        &self,
        size: usize,
        zero_copy: bool,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        self.master.request_frame(size, zero_copy, timeout)
    }

    /// Push a segment onto the link, bypassing the controller
    pub fn send_frame(&self, frame: impl Into<Arc<Frame>>, timeout: Option<Duration>) -> Result<()> {
        self.master.send_frame(frame, timeout)
    }
}

impl BufferSource for Transport {
    /// Inbound segment buffers come from the controller's receive pool
    fn accept_req(&self, size: usize, zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        self.controller.request_rx_frame(size, zero_copy, timeout)
    }
}

impl FrameSink for Transport {
    fn accept_frame(&self, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        self.controller.receive(frame, timeout)
    }
}

/// Endpoint of one virtual channel
pub struct Application {
    channel: u8,
    controller: Arc<Controller>,
    master: Arc<Master>,
}

impl Application {
    pub(crate) fn new(channel: u8, controller: Arc<Controller>, master: Arc<Master>) -> Self {
        Self {
            channel,
            controller,
            master,
        }
    }

    /// Channel this endpoint serves
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Master carrying reassembled frames
    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    /// Attach the consumer of reassembled frames
    pub fn set_slave<S: Slave + 'static>(&self, slave: Arc<S>) {
        self.master.set_slave(slave);
    }

    /// Attach an additional consumer of reassembled frames
    pub fn add_slave<S: FrameSink + 'static>(&self, slave: Arc<S>) {
        self.master.add_slave(slave);
    }

    /// Request a frame from the downstream consumer
    pub fn request_frame(
        &self,
        size: usize,
        zero_copy: bool,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        self.master.request_frame(size, zero_copy, timeout)
    }

    /// Push a frame to the downstream consumers, bypassing the link
    pub fn send_frame(&self, frame: impl Into<Arc<Frame>>, timeout: Option<Duration>) -> Result<()> {
        self.master.send_frame(frame, timeout)
    }
}

impl BufferSource for Application {
    /// Zero-copy requests get buffers laid out to become segments in place
    fn accept_req(&self, size: usize, zero_copy: bool, timeout: Option<Duration>) -> Result<Frame> {
        self.controller.request_frame(size, zero_copy, timeout)
    }
}

impl FrameSink for Application {
    fn accept_frame(&self, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        self.controller.transmit(self.channel, frame, timeout)
    }
}
