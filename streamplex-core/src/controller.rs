//! Packetizer protocol engine
//!
//! The controller splits outgoing frames into segments on the transport
//! master and reassembles incoming segments into frames on the per-channel
//! application masters.
//!
//! ## Receive state machine (per channel)
//!
//! ```text
//!             expected seq, no tail
//!           +---------------------+
//!           v                     |
//!   Idle --start--> Accumulating -+--tail--> deliver, Idle
//!    ^  \                 |
//!    |   \ no start      | gap / timeout / overflow
//!    |    v               v
//!    +-- tail -------- Resync --start--> Accumulating
//! ```
//!
//! Only a segment carrying the start-of-frame bit opens a frame. A gap is
//! any sequence number other than the expected one; a start segment in the
//! middle of a frame means the sender gave up on it, and the partial frame
//! is dropped. Sequence numbers wrap freely within a frame. No
//! retransmission is ever requested: the controller only guarantees that a
//! damaged or incomplete frame is never delivered.

use crate::buffer::Buffer;
use crate::config::{PacketizerConfig, PoolConfig};
use crate::constants::{ERR_OVERFLOW, ERR_SEQUENCE, ERR_TIMEOUT, HEADER_SIZE, MAX_HEADER_SIZE};
use crate::deadline::Deadline;
use crate::error::StreamError;
use crate::frame::Frame;
use crate::pool::Pool;
use crate::segment::{
    can_seal, encode_segment_into, first_payload, inspect_segment, max_payload, open_buffer,
    seal_buffer, segment_count, SegmentHeader,
};
use crate::stream::{BufferSource, Master};
use crate::Result;
use bytes::BytesMut;
use core::time::Duration;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[cfg(feature = "logging")]
use tracing::{debug, info, warn};

/// Reassembly state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// No frame in progress
    Idle,
    /// Collecting segments of a frame
    Accumulating,
    /// Discarding segments until the next tail or start of frame
    Resync,
}

/// Receive-side state of one channel
#[derive(Debug)]
pub(crate) struct ChannelContext {
    state: ChannelState,
    expected: u8,
    frame: Option<Frame>,
    size: usize,
    last_activity: Instant,
}

impl ChannelContext {
    fn new(now: Instant) -> Self {
        Self {
            state: ChannelState::Idle,
            expected: 0,
            frame: None,
            size: 0,
            last_activity: now,
        }
    }

    /// Abandon the frame in progress, tagging it with `error`
    fn discard(&mut self, error: u32) {
        if let Some(mut frame) = self.frame.take() {
            frame.set_error(frame.error() | error);
        }
        self.size = 0;
    }

    fn start(&mut self, header: &SegmentHeader) {
        let mut frame = Frame::new();
        frame.set_flags(header.flags.unwrap_or(0));
        self.frame = Some(frame);
        self.size = 0;
        self.state = ChannelState::Accumulating;
    }

    /// Leave after a fault: a tail segment ends the broken message, anything
    /// else means the rest of it is still on the way
    fn desync(&mut self, header: &SegmentHeader) {
        if header.tail {
            self.state = ChannelState::Idle;
            self.expected = header.sequence.wrapping_add(1);
        } else {
            self.state = ChannelState::Resync;
        }
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ChannelState::Accumulating
            && now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Transmit side of one channel
#[derive(Debug, Default)]
struct TxChannel {
    state: Mutex<TxState>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct TxState {
    busy: bool,
    sequence: u8,
}

/// Exclusive right to send on a channel; hands the sequence back on drop
struct TxTurn<'a> {
    channel: &'a TxChannel,
    sequence: u8,
}

impl Drop for TxTurn<'_> {
    fn drop(&mut self) {
        let mut state = self
            .channel
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.sequence = self.sequence;
        state.busy = false;
        drop(state);
        self.channel.turn.notify_one();
    }
}

/// Protocol counters, updated lock-free
#[derive(Debug, Default)]
pub struct ControllerStats {
    segments_sent: AtomicU64,
    segments_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_delivered: AtomicU64,
    integrity_failures: AtomicU64,
    sequence_errors: AtomicU64,
    protocol_violations: AtomicU64,
    timeouts: AtomicU64,
    dropped_frames: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Segments pushed to the transport
    pub segments_sent: u64,
    /// Segments received from the transport
    pub segments_received: u64,
    /// Frames fully segmented and sent
    pub frames_sent: u64,
    /// Frames reassembled and handed to an application
    pub frames_delivered: u64,
    /// Segments failing their checksum
    pub integrity_failures: u64,
    /// Gaps and duplicates detected
    pub sequence_errors: u64,
    /// Malformed, oversized or misaddressed segments
    pub protocol_violations: u64,
    /// Partial frames expired by the inactivity bound
    pub timeouts: u64,
    /// Partial frames discarded for any reason
    pub dropped_frames: u64,
    /// Reassembled frames an application refused
    pub delivery_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ControllerStats {
    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            segments_sent: load(&self.segments_sent),
            segments_received: load(&self.segments_received),
            frames_sent: load(&self.frames_sent),
            frames_delivered: load(&self.frames_delivered),
            integrity_failures: load(&self.integrity_failures),
            sequence_errors: load(&self.sequence_errors),
            protocol_violations: load(&self.protocol_violations),
            timeouts: load(&self.timeouts),
            dropped_frames: load(&self.dropped_frames),
            delivery_failures: load(&self.delivery_failures),
        }
    }
}

/// Segmentation and reassembly engine shared by the adapters of one core
pub struct Controller {
    config: PacketizerConfig,
    max_payload: usize,
    transport: Arc<Master>,
    applications: Vec<Arc<Master>>,
    tx: Vec<TxChannel>,
    rx: Vec<Mutex<ChannelContext>>,
    rx_pool: Pool,
    stats: ControllerStats,
    epoch: Instant,
    next_sweep_us: AtomicU64,
    closed: AtomicBool,
}

impl Controller {
    /// Create a controller pushing segments into `transport` and reassembled
    /// frames into `applications[channel]`
    pub fn new(
        config: PacketizerConfig,
        transport: Arc<Master>,
        applications: Vec<Arc<Master>>,
    ) -> Result<Self> {
        config.validate()?;
        if applications.len() != config.channels {
            return Err(StreamError::InvalidConfig(format!(
                "{} application masters for {} channels",
                applications.len(),
                config.channels
            )));
        }

        let rx_pool = Pool::new(
            PoolConfig::new(config.mtu).with_max_buffers(config.rx_pool_buffers),
        )?;
        let now = Instant::now();

        #[cfg(feature = "logging")]
        info!(
            "Packetizer controller: {} channels, MTU {}, {:?} integrity",
            config.channels, config.mtu, config.integrity
        );

        Ok(Self {
            max_payload: max_payload(config.mtu, config.integrity),
            tx: (0..config.channels).map(|_| TxChannel::default()).collect(),
            rx: (0..config.channels)
                .map(|_| Mutex::new(ChannelContext::new(now)))
                .collect(),
            config,
            transport,
            applications,
            rx_pool,
            stats: ControllerStats::default(),
            epoch: now,
            next_sweep_us: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &PacketizerConfig {
        &self.config
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// Payload bytes carried by one full segment
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Protocol counters
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Pool that backs inbound segments
    pub fn rx_pool(&self) -> &Pool {
        &self.rx_pool
    }

    /// True once [`Controller::close`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reassembly state of `channel`
    pub fn channel_state(&self, channel: u8) -> Result<ChannelState> {
        Ok(self.rx_context(channel)?.state)
    }

    /// Allocate a frame for an application to fill
    ///
    /// With `zero_copy` every buffer comes from the transport side, laid out
    /// so that it holds at most one segment payload with room reserved for
    /// the header and trailer. Such a frame is sent without copying.
    pub fn request_frame(
        &self,
        size: usize,
        zero_copy: bool,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        self.check_open()?;
        if !zero_copy {
            return Ok(Frame::with_capacity(size));
        }

        let trailer = self.config.integrity.trailer_size();
        let deadline = Deadline::after(timeout);
        let mut frame = Frame::new();
        while frame.buffer_count() == 0 || frame.capacity() < size {
            let segment = self
                .transport
                .request_frame(self.config.mtu, true, deadline.remaining()?)?;
            let buffers = segment.into_buffers();
            if buffers.is_empty() {
                return Ok(Frame::with_capacity(size));
            }
            for mut buffer in buffers {
                // The first buffer keeps room for the flag word
                let header_len = if frame.buffer_count() == 0 {
                    MAX_HEADER_SIZE
                } else {
                    HEADER_SIZE
                };
                let raw = buffer.raw_size();
                if raw <= header_len + trailer {
                    #[cfg(feature = "logging")]
                    debug!("Transport buffer of {} bytes too small for zero-copy", raw);
                    return Ok(Frame::with_capacity(size));
                }
                let limit = self.max_payload.saturating_sub(header_len - HEADER_SIZE);
                let payload = (raw - header_len - trailer).min(limit);
                buffer.set_head_room(0);
                buffer.set_payload(0);
                buffer.set_tail_room(raw - header_len - payload);
                buffer.set_head_room(header_len);
                frame.push_buffer(buffer);
            }
        }
        Ok(frame)
    }

    /// Allocate a frame for an inbound segment
    pub fn request_rx_frame(
        &self,
        size: usize,
        zero_copy: bool,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        self.check_open()?;
        self.rx_pool.accept_req(size, zero_copy, timeout)
    }

    /// Segment `frame` and push it onto the transport as channel `channel`
    ///
    /// One frame is sent at a time per channel; waiting for the channel
    /// counts against `timeout` and ends with `TransportClosed` on close.
    /// Sequence numbers are consumed even by segments that fail to send, so
    /// the receiver sees the loss as a gap. `Err(Timeout)` is backpressure
    /// from the transport.
    pub fn transmit(&self, channel: u8, frame: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        self.check_open()?;
        let deadline = Deadline::after(timeout);
        let mut turn = self.acquire_tx(channel, &deadline)?;

        match Arc::try_unwrap(frame) {
            Ok(frame) if self.can_transmit_in_place(&frame) => {
                self.transmit_in_place(channel, frame, &mut turn.sequence, &deadline)?
            }
            Ok(frame) => self.transmit_copy(channel, &frame, &mut turn.sequence, &deadline)?,
            Err(shared) => self.transmit_copy(channel, &shared, &mut turn.sequence, &deadline)?,
        }

        bump(&self.stats.frames_sent);
        Ok(())
    }

    /// Wait for the channel's transmit turn until `deadline`
    fn acquire_tx(&self, channel: u8, deadline: &Deadline) -> Result<TxTurn<'_>> {
        let tx = self
            .tx
            .get(channel as usize)
            .ok_or(StreamError::InvalidChannel(channel))?;
        let mut state = tx.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            self.check_open()?;
            if !state.busy {
                break;
            }
            state = deadline.wait(&tx.turn, state)?;
        }
        state.busy = true;
        Ok(TxTurn {
            channel: tx,
            sequence: state.sequence,
        })
    }

    fn can_transmit_in_place(&self, frame: &Frame) -> bool {
        let integrity = self.config.integrity;
        let flags = frame.flags();
        let first_header = if flags == 0 {
            HEADER_SIZE
        } else {
            MAX_HEADER_SIZE
        };

        // Same selection as transmit_in_place: empty buffers are skipped
        let mut sent = frame.buffers().iter().filter(|b| b.payload() > 0);
        let first = match sent.next().or_else(|| frame.buffers().first()) {
            Some(first) => first,
            None => return false,
        };
        can_seal(
            first,
            first_header,
            integrity,
            first_payload(self.max_payload, flags),
        ) && sent.all(|b| can_seal(b, HEADER_SIZE, integrity, self.max_payload))
    }

    fn transmit_in_place(
        &self,
        channel: u8,
        frame: Frame,
        sequence: &mut u8,
        deadline: &Deadline,
    ) -> Result<()> {
        let flags = frame.flags();
        let mut buffers = frame.into_buffers();
        if buffers.iter().any(|b| b.payload() > 0) {
            buffers.retain(|b| b.payload() > 0);
        } else {
            buffers.truncate(1);
        }

        let last = buffers.len() - 1;
        for (index, mut buffer) in buffers.into_iter().enumerate() {
            let mut header =
                SegmentHeader::new(channel, *sequence, index == last, buffer.payload())?;
            if index == 0 {
                header = header.with_flags(flags);
            }
            *sequence = sequence.wrapping_add(1);
            seal_buffer(&mut buffer, &header, self.config.integrity);
            self.push_segment(Frame::from_buffers(vec![buffer]), deadline)?;
        }

        #[cfg(feature = "logging")]
        debug!("Channel {}: sent {} segments in place", channel, last + 1);

        Ok(())
    }

    fn transmit_copy(
        &self,
        channel: u8,
        frame: &Frame,
        sequence: &mut u8,
        deadline: &Deadline,
    ) -> Result<()> {
        let integrity = self.config.integrity;
        let flags = frame.flags();
        let total = frame.payload();
        let count = segment_count(total, self.max_payload, flags);
        let mut chunk = vec![0u8; total.min(self.max_payload)];
        let mut scratch = BytesMut::with_capacity(self.config.mtu);
        let mut offset = 0;

        for index in 0..count {
            let room = if index == 0 {
                first_payload(self.max_payload, flags)
            } else {
                self.max_payload
            };
            let len = (total - offset).min(room);
            let read = frame.read_at(offset, &mut chunk[..len]);
            offset += len;
            let mut header = SegmentHeader::new(channel, *sequence, index + 1 == count, read)?;
            if index == 0 {
                header = header.with_flags(flags);
            }
            *sequence = sequence.wrapping_add(1);

            scratch.clear();
            encode_segment_into(&header, &chunk[..read], integrity, &mut scratch)?;

            let mut segment =
                self.transport
                    .request_frame(scratch.len(), false, deadline.remaining()?)?;
            if segment.write_at(0, &scratch) != scratch.len() {
                return Err(StreamError::AllocationFailure(format!(
                    "Transport returned {} bytes for a {}-byte segment",
                    segment.capacity(),
                    scratch.len()
                )));
            }
            self.push_segment(segment, deadline)?;
        }

        #[cfg(feature = "logging")]
        debug!("Channel {}: sent {} bytes in {} segments", channel, total, count);

        Ok(())
    }

    fn push_segment(&self, segment: Frame, deadline: &Deadline) -> Result<()> {
        self.transport.send_frame(segment, deadline.remaining()?)?;
        bump(&self.stats.segments_sent);
        Ok(())
    }

    /// Feed one inbound segment into reassembly
    ///
    /// Damaged or out-of-sequence data is dropped and counted, never
    /// reported as an error. `Err` only means the controller is closed.
    /// `timeout` bounds delivery of a completed frame to the application.
    pub fn receive(&self, segment: Arc<Frame>, timeout: Option<Duration>) -> Result<()> {
        self.check_open()?;
        let now = Instant::now();
        self.maybe_sweep(now);
        bump(&self.stats.segments_received);

        let header = match inspect_segment(&segment, self.config.mtu, self.config.integrity) {
            Ok(header) => header,
            Err(err) => {
                if matches!(err, StreamError::IntegrityFailure { .. }) {
                    bump(&self.stats.integrity_failures);
                } else {
                    bump(&self.stats.protocol_violations);
                }

                #[cfg(feature = "logging")]
                warn!("Dropping segment: {}", err);

                return Ok(());
            }
        };

        let channel = header.channel;
        if channel as usize >= self.config.channels {
            bump(&self.stats.protocol_violations);

            #[cfg(feature = "logging")]
            warn!("Dropping segment for unconfigured channel {}", channel);

            return Ok(());
        }

        let payload = extract_payload(segment, &header);
        let completed = {
            let mut ctx = self.rx_context(channel)?;
            self.advance(&mut ctx, &header, payload, now)
        };

        if let Some(frame) = completed {
            self.deliver(channel, frame, timeout);
        }
        Ok(())
    }

    /// Step the channel's state machine with one validated segment
    fn advance(
        &self,
        ctx: &mut ChannelContext,
        header: &SegmentHeader,
        payload: Buffer,
        now: Instant,
    ) -> Option<Frame> {
        let channel = header.channel;
        let sequence = header.sequence;

        if let Some(timeout) = self.config.reassembly_timeout() {
            if ctx.is_stale(now, timeout) {
                self.expire(channel, ctx);
            }
        }

        match ctx.state {
            ChannelState::Accumulating if sequence == ctx.expected && !header.start => {}
            ChannelState::Accumulating => {
                if sequence != ctx.expected {
                    self.sequence_error(channel, ctx.expected, sequence);
                }
                ctx.discard(ERR_SEQUENCE);
                bump(&self.stats.dropped_frames);
                if header.start {
                    ctx.start(header);
                } else {
                    ctx.desync(header);
                    return None;
                }
            }
            ChannelState::Idle => {
                // Whole frames may have gone missing; a start segment still
                // opens the next one
                if sequence != ctx.expected {
                    self.sequence_error(channel, ctx.expected, sequence);
                }
                if !header.start {
                    ctx.desync(header);
                    return None;
                }
                ctx.start(header);
            }
            ChannelState::Resync => {
                if !header.start {
                    ctx.desync(header);
                    return None;
                }
                ctx.start(header);
            }
        }

        ctx.expected = sequence.wrapping_add(1);
        ctx.last_activity = now;
        ctx.size += payload.payload();

        let limit = self.config.max_frame_size;
        if limit != 0 && ctx.size > limit {
            bump(&self.stats.protocol_violations);
            bump(&self.stats.dropped_frames);

            #[cfg(feature = "logging")]
            warn!(
                "Channel {}: frame exceeds {} bytes, discarding",
                channel, limit
            );

            ctx.discard(ERR_OVERFLOW);
            ctx.state = if header.tail {
                ChannelState::Idle
            } else {
                ChannelState::Resync
            };
            return None;
        }

        if let Some(frame) = ctx.frame.as_mut() {
            if payload.payload() > 0 {
                frame.push_buffer(payload);
            }
        }

        if !header.tail {
            return None;
        }
        ctx.state = ChannelState::Idle;
        ctx.size = 0;
        ctx.frame.take()
    }

    fn sequence_error(&self, _channel: u8, _expected: u8, _actual: u8) {
        bump(&self.stats.sequence_errors);

        #[cfg(feature = "logging")]
        warn!(
            "Channel {}: expected sequence {}, got {}",
            _channel, _expected, _actual
        );
    }

    fn expire(&self, _channel: u8, ctx: &mut ChannelContext) {
        bump(&self.stats.timeouts);
        bump(&self.stats.dropped_frames);

        #[cfg(feature = "logging")]
        warn!(
            "Channel {}: reassembly idle past {} ms, discarding {} bytes",
            _channel, self.config.reassembly_timeout_ms, ctx.size
        );

        ctx.discard(ERR_TIMEOUT);
        ctx.state = ChannelState::Resync;
    }

    fn deliver(&self, channel: u8, frame: Frame, timeout: Option<Duration>) {
        #[cfg(feature = "logging")]
        let size = frame.payload();
        match self.applications[channel as usize].send_frame(frame, timeout) {
            Ok(()) => {
                bump(&self.stats.frames_delivered);

                #[cfg(feature = "logging")]
                debug!("Channel {}: delivered {}-byte frame", channel, size);
            }
            Err(_e) => {
                bump(&self.stats.delivery_failures);

                #[cfg(feature = "logging")]
                warn!(
                    "Channel {}: application refused {}-byte frame: {}",
                    channel, size, _e
                );
            }
        }
    }

    /// Discard partial frames idle past the reassembly timeout
    ///
    /// Runs automatically as segments arrive; call it directly when the link
    /// may go quiet. Returns the number of frames discarded.
    pub fn expire_stale(&self) -> usize {
        self.expire_stale_at(Instant::now())
    }

    fn expire_stale_at(&self, now: Instant) -> usize {
        let Some(timeout) = self.config.reassembly_timeout() else {
            return 0;
        };
        let mut expired = 0;
        for (channel, ctx) in self.rx.iter().enumerate() {
            let mut ctx = ctx.lock().unwrap_or_else(PoisonError::into_inner);
            if ctx.is_stale(now, timeout) {
                self.expire(channel as u8, &mut ctx);
                expired += 1;
            }
        }
        expired
    }

    /// Sweep all channels at most twice per timeout period
    fn maybe_sweep(&self, now: Instant) {
        let Some(timeout) = self.config.reassembly_timeout() else {
            return;
        };
        let now_us = now.saturating_duration_since(self.epoch).as_micros() as u64;
        let due = self.next_sweep_us.load(Ordering::Relaxed);
        if now_us < due {
            return;
        }
        let next = now_us + (timeout.as_micros() as u64 / 2).max(1);
        if self
            .next_sweep_us
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.expire_stale_at(now);
        }
    }

    /// Stop traffic: fail new calls, wake pool waiters and drop partial frames
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rx_pool.close();
        for tx in &self.tx {
            // Lock so a sender between its closed check and its wait sees this
            let _state = tx.state.lock().unwrap_or_else(PoisonError::into_inner);
            tx.turn.notify_all();
        }
        for ctx in &self.rx {
            let mut ctx = ctx.lock().unwrap_or_else(PoisonError::into_inner);
            ctx.discard(0);
            ctx.state = ChannelState::Idle;
        }

        #[cfg(feature = "logging")]
        info!("Packetizer controller closed");
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StreamError::TransportClosed)
        } else {
            Ok(())
        }
    }

    fn rx_context(&self, channel: u8) -> Result<MutexGuard<'_, ChannelContext>> {
        self.rx
            .get(channel as usize)
            .map(|ctx| ctx.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or(StreamError::InvalidChannel(channel))
    }
}

/// Take the payload out of a validated segment, in place when possible
fn extract_payload(segment: Arc<Frame>, header: &SegmentHeader) -> Buffer {
    match Arc::try_unwrap(segment) {
        Ok(frame) if frame.buffer_count() == 1 => {
            let mut buffer = frame.into_buffers().swap_remove(0);
            open_buffer(&mut buffer, header);
            buffer
        }
        Ok(frame) => copy_payload(&frame, header),
        Err(shared) => copy_payload(&shared, header),
    }
}

fn copy_payload(segment: &Frame, header: &SegmentHeader) -> Buffer {
    let len = header.payload_len as usize;
    let mut buffer = Buffer::new(len);
    buffer.set_payload(len);
    segment.read_at(header.header_len(), buffer.payload_slice_mut());
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::IntegrityCheck;
    use crate::segment::encode_segment;
    use crate::stream::FrameSink;

    #[derive(Default)]
    struct Capture {
        frames: Mutex<Vec<Arc<Frame>>>,
    }

    impl BufferSource for Capture {}

    impl FrameSink for Capture {
        fn accept_frame(&self, frame: Arc<Frame>, _timeout: Option<Duration>) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    impl Capture {
        fn payloads(&self) -> Vec<Vec<u8>> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.to_bytes().to_vec())
                .collect()
        }
    }

    struct Rig {
        controller: Controller,
        wire: Arc<Capture>,
        apps: Vec<Arc<Capture>>,
    }

    fn rig(config: PacketizerConfig) -> Rig {
        let transport = Arc::new(Master::new());
        let wire = Arc::new(Capture::default());
        transport.set_slave(wire.clone());

        let mut masters = Vec::new();
        let mut apps = Vec::new();
        for _ in 0..config.channels {
            let master = Arc::new(Master::new());
            let app = Arc::new(Capture::default());
            master.set_slave(app.clone());
            masters.push(master);
            apps.push(app);
        }
        Rig {
            controller: Controller::new(config, transport, masters).unwrap(),
            wire,
            apps,
        }
    }

    fn scenario_config() -> PacketizerConfig {
        PacketizerConfig::default()
            .with_mtu(188)
            .with_integrity(IntegrityCheck::None)
    }

    fn segment(channel: u8, seq: u8, start: bool, tail: bool, payload: &[u8]) -> Arc<Frame> {
        let mut header = SegmentHeader::new(channel, seq, tail, payload.len()).unwrap();
        if start {
            header = header.with_start();
        }
        let bytes = encode_segment(&header, payload, IntegrityCheck::None).unwrap();
        Arc::new(Frame::from_slice(&bytes))
    }

    /// Wire slave that holds every segment until opened
    #[derive(Default)]
    struct Gate {
        state: Mutex<(bool, usize)>,
        changed: Condvar,
    }

    impl BufferSource for Gate {}

    impl FrameSink for Gate {
        fn accept_frame(&self, _frame: Arc<Frame>, _timeout: Option<Duration>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.1 += 1;
            self.changed.notify_all();
            while !state.0 {
                state = self.changed.wait(state).unwrap();
            }
            Ok(())
        }
    }

    impl Gate {
        fn wait_entered(&self) {
            let mut state = self.state.lock().unwrap();
            while state.1 == 0 {
                state = self.changed.wait(state).unwrap();
            }
        }

        fn open(&self) {
            self.state.lock().unwrap().0 = true;
            self.changed.notify_all();
        }
    }

    #[test]
    fn test_transmit_segments_scenario() {
        let rig = rig(scenario_config());
        let data: Vec<u8> = (0..500).map(|i| i as u8).collect();
        rig.controller
            .transmit(2, Arc::new(Frame::from_slice(&data)), None)
            .unwrap();

        let wire = rig.wire.frames.lock().unwrap();
        let headers: Vec<SegmentHeader> = wire
            .iter()
            .map(|f| inspect_segment(f, 188, IntegrityCheck::None).unwrap())
            .collect();
        let lens: Vec<u16> = headers.iter().map(|h| h.payload_len).collect();
        let seqs: Vec<u8> = headers.iter().map(|h| h.sequence).collect();
        let starts: Vec<bool> = headers.iter().map(|h| h.start).collect();
        let tails: Vec<bool> = headers.iter().map(|h| h.tail).collect();

        assert_eq!(lens, vec![184, 184, 132]);
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(starts, vec![true, false, false]);
        assert_eq!(tails, vec![false, false, true]);
        assert!(headers.iter().all(|h| h.channel == 2 && h.flags.is_none()));
    }

    #[test]
    fn test_flags_carried_on_start_segment() {
        let rig = rig(scenario_config());
        let data: Vec<u8> = (0..500).map(|i| i as u8).collect();
        let mut frame = Frame::from_slice(&data);
        frame.set_flags(0xA5A5_0001);
        rig.controller.transmit(2, Arc::new(frame), None).unwrap();

        let wire: Vec<Arc<Frame>> = rig.wire.frames.lock().unwrap().drain(..).collect();
        let headers: Vec<SegmentHeader> = wire
            .iter()
            .map(|f| inspect_segment(f, 188, IntegrityCheck::None).unwrap())
            .collect();
        let lens: Vec<u16> = headers.iter().map(|h| h.payload_len).collect();
        assert_eq!(lens, vec![180, 184, 136]);
        assert_eq!(headers[0].flags, Some(0xA5A5_0001));
        assert!(headers[1..].iter().all(|h| h.flags.is_none()));

        for seg in wire {
            assert!(seg.payload() <= 188);
            rig.controller.receive(seg, None).unwrap();
        }
        let delivered = rig.apps[2].frames.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].flags(), 0xA5A5_0001);
        assert_eq!(delivered[0].error(), 0);
        assert_eq!(delivered[0].to_bytes().to_vec(), data);
    }

    #[test]
    fn test_receive_reassembles() {
        let rig = rig(scenario_config());
        rig.controller
            .receive(segment(1, 0, true, false, b"hel"), None)
            .unwrap();
        assert_eq!(
            rig.controller.channel_state(1).unwrap(),
            ChannelState::Accumulating
        );
        rig.controller
            .receive(segment(1, 1, false, true, b"lo"), None)
            .unwrap();

        assert_eq!(rig.apps[1].payloads(), vec![b"hello".to_vec()]);
        assert_eq!(rig.controller.channel_state(1).unwrap(), ChannelState::Idle);
        assert_eq!(rig.controller.stats().snapshot().frames_delivered, 1);
    }

    #[test]
    fn test_gap_discards_and_resyncs() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        c.receive(segment(0, 0, true, false, b"aa"), None).unwrap();
        // seq 1 lost
        c.receive(segment(0, 2, false, false, b"cc"), None).unwrap();
        assert_eq!(c.channel_state(0).unwrap(), ChannelState::Resync);
        c.receive(segment(0, 3, false, true, b"dd"), None).unwrap();
        assert_eq!(c.channel_state(0).unwrap(), ChannelState::Idle);

        c.receive(segment(0, 4, true, false, b"ne"), None).unwrap();
        c.receive(segment(0, 5, false, true, b"xt"), None).unwrap();

        assert_eq!(rig.apps[0].payloads(), vec![b"next".to_vec()]);
        let stats = c.stats().snapshot();
        assert_eq!(stats.sequence_errors, 1);
        assert_eq!(stats.dropped_frames, 1);
    }

    #[test]
    fn test_idle_gap_waits_for_tail() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        c.receive(segment(0, 0, true, true, b"one"), None).unwrap();
        // First segment of the next frame lost
        c.receive(segment(0, 2, false, false, b"tw"), None).unwrap();
        c.receive(segment(0, 3, false, true, b"o"), None).unwrap();
        c.receive(segment(0, 4, true, true, b"three"), None).unwrap();

        assert_eq!(
            rig.apps[0].payloads(),
            vec![b"one".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_idle_start_after_lost_frames() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        c.receive(segment(0, 0, true, true, b"one"), None).unwrap();
        // Frames at seq 1..=9 lost entirely
        c.receive(segment(0, 10, true, true, b"ten"), None).unwrap();

        assert_eq!(rig.apps[0].payloads(), vec![b"one".to_vec(), b"ten".to_vec()]);
        assert_eq!(c.stats().snapshot().sequence_errors, 1);
    }

    #[test]
    fn test_start_segment_abandons_partial() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        c.receive(segment(3, 0, true, false, b"stale"), None).unwrap();
        c.receive(segment(3, 1, true, true, b"fresh"), None).unwrap();

        assert_eq!(rig.apps[3].payloads(), vec![b"fresh".to_vec()]);
        let stats = c.stats().snapshot();
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(stats.sequence_errors, 0);
    }

    #[test]
    fn test_sequence_wrap_inside_frame() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        let count = 300;
        for i in 0..count {
            let seg = segment(0, i as u8, i == 0, i + 1 == count, &[i as u8]);
            c.receive(seg, None).unwrap();
        }

        let expected: Vec<u8> = (0..count).map(|i| i as u8).collect();
        assert_eq!(rig.apps[0].payloads(), vec![expected]);
        assert_eq!(c.stats().snapshot().sequence_errors, 0);
    }

    #[test]
    fn test_loss_before_sequence_wrap_drops_frame() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        let count = 300;
        for i in (0..count).filter(|i| *i != 10) {
            let seg = segment(0, i as u8, i == 0, i + 1 == count, &[i as u8]);
            c.receive(seg, None).unwrap();
        }
        // The wrapped seq 0 at index 256 must not reopen a frame
        assert!(rig.apps[0].payloads().is_empty());
        assert_eq!(c.channel_state(0).unwrap(), ChannelState::Idle);

        let next = count as u8;
        c.receive(segment(0, next, true, false, b"ne"), None).unwrap();
        c.receive(segment(0, next.wrapping_add(1), false, true, b"xt"), None)
            .unwrap();
        assert_eq!(rig.apps[0].payloads(), vec![b"next".to_vec()]);

        let stats = c.stats().snapshot();
        assert_eq!(stats.sequence_errors, 1);
        assert_eq!(stats.dropped_frames, 1);
    }

    #[test]
    fn test_duplicate_segment_is_a_gap() {
        let rig = rig(scenario_config());
        let c = &rig.controller;
        c.receive(segment(0, 0, true, false, b"a"), None).unwrap();
        c.receive(segment(0, 1, false, false, b"b"), None).unwrap();
        c.receive(segment(0, 1, false, false, b"b"), None).unwrap();
        c.receive(segment(0, 2, false, true, b"c"), None).unwrap();
        assert!(rig.apps[0].payloads().is_empty());
    }

    #[test]
    fn test_corrupt_segment_counted() {
        let rig = rig(PacketizerConfig::default());
        let header = SegmentHeader::new(0, 0, true, 4).unwrap().with_start();
        let mut bytes = encode_segment(&header, b"data", IntegrityCheck::Crc32c)
            .unwrap()
            .to_vec();
        bytes[4] ^= 0xFF;
        rig.controller
            .receive(Arc::new(Frame::from_slice(&bytes)), None)
            .unwrap();

        assert!(rig.apps[0].payloads().is_empty());
        assert_eq!(rig.controller.stats().snapshot().integrity_failures, 1);
    }

    #[test]
    fn test_unconfigured_channel_rejected() {
        let rig = rig(scenario_config());
        rig.controller
            .receive(segment(50, 0, true, true, b"x"), None)
            .unwrap();
        assert_eq!(rig.controller.stats().snapshot().protocol_violations, 1);
        assert_eq!(
            rig.controller.transmit(50, Arc::new(Frame::new()), None),
            Err(StreamError::InvalidChannel(50))
        );
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let rig = rig(scenario_config().with_max_frame_size(4));
        let c = &rig.controller;
        c.receive(segment(0, 0, true, false, b"abc"), None).unwrap();
        c.receive(segment(0, 1, false, false, b"def"), None).unwrap();
        assert_eq!(c.channel_state(0).unwrap(), ChannelState::Resync);
        c.receive(segment(0, 2, false, true, b"g"), None).unwrap();
        c.receive(segment(0, 3, true, true, b"ok"), None).unwrap();
        assert_eq!(rig.apps[0].payloads(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_stale_context_expires() {
        let rig = rig(scenario_config().with_reassembly_timeout_ms(10));
        let c = &rig.controller;
        c.receive(segment(0, 0, true, false, b"slow"), None).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(c.expire_stale(), 1);
        assert_eq!(c.channel_state(0).unwrap(), ChannelState::Resync);
        assert_eq!(c.stats().snapshot().timeouts, 1);

        c.receive(segment(0, 1, false, true, b"late"), None).unwrap();
        assert!(rig.apps[0].payloads().is_empty());
    }

    #[test]
    fn test_empty_frame_round_trip() {
        let rig = rig(scenario_config());
        rig.controller.transmit(0, Arc::new(Frame::new()), None).unwrap();
        let wire: Vec<Arc<Frame>> = rig.wire.frames.lock().unwrap().drain(..).collect();
        assert_eq!(wire.len(), 1);
        for seg in wire {
            rig.controller.receive(seg, None).unwrap();
        }
        assert_eq!(rig.apps[0].payloads(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_zero_copy_frame_sent_in_place() {
        let rig = rig(PacketizerConfig::default().with_mtu(64));
        let c = &rig.controller;
        let mut frame = c.request_frame(100, true, None).unwrap();
        assert!(frame.capacity() >= 100);
        assert_eq!(frame.buffers()[0].head_room(), MAX_HEADER_SIZE);
        assert_eq!(frame.buffers()[1].head_room(), HEADER_SIZE);
        let data: Vec<u8> = (0..100).collect();
        assert_eq!(frame.write_at(0, &data), 100);
        frame.set_flags(7);

        c.transmit(1, Arc::new(frame), None).unwrap();
        let wire: Vec<Arc<Frame>> = rig.wire.frames.lock().unwrap().drain(..).collect();
        assert_eq!(wire.len(), 2);
        for seg in wire {
            assert!(seg.payload() <= 64);
            c.receive(seg, None).unwrap();
        }
        assert_eq!(rig.apps[1].payloads(), vec![data]);
        assert_eq!(rig.apps[1].frames.lock().unwrap()[0].flags(), 7);
    }

    #[test]
    fn test_same_channel_transmit_times_out() {
        let transport = Arc::new(Master::new());
        let gate = Arc::new(Gate::default());
        transport.set_slave(gate.clone());
        let masters = (0..2).map(|_| Arc::new(Master::new())).collect();
        let config = scenario_config().with_channels(2);
        let controller = Controller::new(config, transport, masters).unwrap();

        std::thread::scope(|s| {
            let first = s.spawn(|| controller.transmit(0, Arc::new(Frame::from_slice(b"a")), None));
            gate.wait_entered();

            let start = Instant::now();
            let timeout = Some(Duration::from_millis(50));
            let second = controller.transmit(0, Arc::new(Frame::from_slice(b"b")), timeout);
            assert_eq!(second, Err(StreamError::Timeout));
            assert!(start.elapsed() >= Duration::from_millis(50));

            gate.open();
            assert_eq!(first.join().unwrap(), Ok(()));
        });

        // The turn was handed back
        let timeout = Some(Duration::from_secs(5));
        assert_eq!(
            controller.transmit(0, Arc::new(Frame::from_slice(b"c")), timeout),
            Ok(())
        );
        assert_eq!(controller.stats().snapshot().frames_sent, 2);
    }

    #[test]
    fn test_close_wakes_waiting_sender() {
        let transport = Arc::new(Master::new());
        let gate = Arc::new(Gate::default());
        transport.set_slave(gate.clone());
        let masters = (0..1).map(|_| Arc::new(Master::new())).collect();
        let config = scenario_config().with_channels(1);
        let controller = Controller::new(config, transport, masters).unwrap();

        std::thread::scope(|s| {
            let first = s.spawn(|| controller.transmit(0, Arc::new(Frame::from_slice(b"a")), None));
            gate.wait_entered();

            let waiting = s.spawn(|| controller.transmit(0, Arc::new(Frame::from_slice(b"b")), None));
            std::thread::sleep(Duration::from_millis(20));
            controller.close();
            assert_eq!(waiting.join().unwrap(), Err(StreamError::TransportClosed));

            gate.open();
            let _ = first.join().unwrap();
        });
    }

    #[test]
    fn test_close_rejects_traffic() {
        let rig = rig(scenario_config());
        rig.controller
            .receive(segment(0, 0, true, false, b"partial"), None)
            .unwrap();
        rig.controller.close();

        assert!(rig.controller.is_closed());
        assert!(rig.controller.rx_pool().is_closed());
        assert_eq!(
            rig.controller.transmit(0, Arc::new(Frame::new()), None),
            Err(StreamError::TransportClosed)
        );
        assert_eq!(
            rig.controller.receive(segment(0, 1, false, true, b"x"), None),
            Err(StreamError::TransportClosed)
        );
    }
}
