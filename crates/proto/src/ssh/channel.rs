//! SSH channel: a bidirectional logical stream over one transport.
//!
//! A channel is identified by its (local, remote) channel number pair and
//! owns an inbound [`Buffer`], an outbound flow-control window, a maximum
//! packet size, a close state, and an idle timer.
//!
//! # State machine
//!
//! ```text
//! opening --OPEN_CONFIRM--> open --CLOSE(rx)--> half_closed_rx
//!    |                       |                        |
//!    +--OPEN_FAIL--> closed  +--close()--> closing <--+-- eof()/close()
//!                                             |
//!                                   CLOSE(rx) +--> closed
//! ```
//!
//! Local `eof()` sends EOF without leaving `open`; once the peer has
//! closed its direction (`half_closed_rx`), a local `eof()` or `close()`
//! moves to `closing`. A received CLOSE in `closing` completes the
//! handshake.
//!
//! # Flow control
//!
//! Writes consume the window the peer granted us and block while it is
//! zero; WINDOW_ADJUST replenishes it. On the receive side, consumed
//! bytes accumulate until they reach half the advertised window, then one
//! WINDOW_ADJUST is emitted to amortise round-trips.

use crate::ssh::buffer::{Buffer, IdleTimer};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelFailure, ChannelRequest, ChannelRequestType,
    ChannelSuccess, ChannelWindowAdjust,
};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tether_platform::{TetherError, TetherResult};
use tokio::sync::mpsc;

/// Channel close state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// OPEN sent, waiting for OPEN_CONFIRMATION or OPEN_FAILURE.
    Opening,
    /// Both directions open.
    Open,
    /// The peer closed its direction; we may still send.
    HalfClosedRx,
    /// We sent CLOSE and are waiting for the peer's CLOSE.
    Closing,
    /// Terminal.
    Closed,
}

/// A logical SSH channel.
///
/// Shared between the owning caller (reads, writes, close) and the
/// dispatcher (inbound delivery); all mutation is behind internal locks.
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    /// Receive window we advertised at open.
    recv_initial_window: u32,
    /// Largest DATA payload the peer accepts.
    peer_max_packet: u32,

    state: Mutex<ChannelState>,

    /// Credit the peer has granted us, guarded with `out_cond`.
    out_window: Mutex<u32>,
    out_cond: Condvar,

    /// Remaining credit we have granted the peer.
    in_window: Mutex<u32>,
    /// Bytes consumed by the reader since the last WINDOW_ADJUST.
    pending_adjust: Mutex<u32>,

    buffer: Buffer,
    idle: Arc<IdleTimer>,

    /// Framed payloads for the transport's outbound writer task.
    outbound: mpsc::UnboundedSender<Vec<u8>>,

    /// Out-of-band requests, taken once by the request consumer.
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelRequest>>>,
}

impl Channel {
    /// Creates a channel in the given starting state.
    ///
    /// `our_window` is the receive window we advertised; `peer_window` and
    /// `peer_max_packet` are what the peer advertised.
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        our_window: u32,
        peer_window: u32,
        peer_max_packet: u32,
        state: ChannelState,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        request_rx: mpsc::UnboundedReceiver<ChannelRequest>,
    ) -> Self {
        let idle = Arc::new(IdleTimer::new());
        Self {
            local_id,
            remote_id,
            recv_initial_window: our_window,
            peer_max_packet,
            state: Mutex::new(state),
            out_window: Mutex::new(peer_window),
            out_cond: Condvar::new(),
            in_window: Mutex::new(our_window),
            pending_adjust: Mutex::new(0),
            buffer: Buffer::new(Arc::clone(&idle)),
            idle,
            outbound,
            request_rx: Mutex::new(Some(request_rx)),
        }
    }

    /// Returns the local channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the remote channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the current close state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state lock poisoned")
    }

    /// Returns the remaining outbound window.
    pub fn out_window(&self) -> u32 {
        *self.out_window.lock().expect("channel window lock poisoned")
    }

    /// Sets the read-idle timeout. A zero duration disables it.
    pub fn set_idle_timeout(&self, duration: Duration) {
        self.idle.set_duration(duration);
    }

    /// Returns the idle timer.
    pub fn idle_timer(&self) -> &Arc<IdleTimer> {
        &self.idle
    }

    /// Takes the out-of-band request receiver. Returns `None` after the
    /// first call; there is exactly one request consumer per channel.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<ChannelRequest>> {
        self.request_rx
            .lock()
            .expect("channel request lock poisoned")
            .take()
    }

    /// Reads from the inbound buffer, blocking per the buffer contract.
    ///
    /// Bytes arrive in the order the peer wrote them. A successful read
    /// resets the idle timer and, once enough bytes have been consumed,
    /// replenishes the peer's window.
    ///
    /// # Errors
    ///
    /// - [`TetherError::Eof`] after the peer's EOF/CLOSE drains
    /// - [`TetherError::Timeout`] when the idle timer fires; the channel
    ///   stays usable
    /// - [`TetherError::Cancelled`] after a halt
    pub fn read(&self, dst: &mut [u8]) -> TetherResult<usize> {
        let n = self.buffer.read(dst)?;
        self.record_consumed(n as u32)?;
        Ok(n)
    }

    /// Writes the whole payload, splitting it into DATA messages no larger
    /// than the peer's maximum packet size and blocking while the window
    /// is exhausted. Partial writes are never reported: the payload is
    /// fully submitted or an error is returned.
    ///
    /// # Errors
    ///
    /// - [`TetherError::Closed`] if the channel is closed or closing
    /// - [`TetherError::Cancelled`] after a halt
    pub fn write(&self, data: &[u8]) -> TetherResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let want = (data.len() - offset).min(self.peer_max_packet as usize) as u32;
            let granted = self.reserve_window(want)? as usize;
            let chunk = &data[offset..offset + granted];
            self.submit(ChannelData::new(self.remote_id, chunk.to_vec()).to_bytes())?;
            offset += granted;
        }
        Ok(())
    }

    /// Blocks until at least one byte of window is available and reserves
    /// up to `want` bytes of it.
    fn reserve_window(&self, want: u32) -> TetherResult<u32> {
        let mut window = self.out_window.lock().expect("channel window lock poisoned");
        loop {
            if !self.writable_state() {
                return Err(TetherError::Closed("channel closed".to_string()));
            }
            if self.idle.halted() {
                return Err(TetherError::Cancelled("channel halted".to_string()));
            }
            if *window > 0 {
                let granted = want.min(*window);
                *window -= granted;
                return Ok(granted);
            }
            let (guard, _) = self
                .out_cond
                .wait_timeout(window, Duration::from_millis(100))
                .expect("channel window lock poisoned");
            window = guard;
        }
    }

    fn writable_state(&self) -> bool {
        matches!(self.state(), ChannelState::Open | ChannelState::HalfClosedRx)
    }

    /// Signals that no more data will be sent locally.
    ///
    /// In `open`, sends EOF and stays; once the peer has already closed
    /// (`half_closed_rx`), sends EOF and moves to `closing`.
    pub fn eof(&self) -> TetherResult<()> {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        match *state {
            ChannelState::Open => {
                self.submit(ChannelEof::new(self.remote_id).to_bytes())?;
            }
            ChannelState::HalfClosedRx => {
                self.submit(ChannelEof::new(self.remote_id).to_bytes())?;
                *state = ChannelState::Closing;
            }
            _ => {}
        }
        Ok(())
    }

    /// Closes the channel locally: sends CLOSE and moves to `closing`.
    /// Pending reads drain buffered bytes, then fail with `Eof`.
    pub fn close(&self) -> TetherResult<()> {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        match *state {
            ChannelState::Open | ChannelState::HalfClosedRx => {
                self.submit(ChannelClose::new(self.remote_id).to_bytes())?;
                *state = ChannelState::Closing;
                drop(state);
                self.buffer.eof();
                self.out_cond.notify_all();
            }
            _ => {}
        }
        Ok(())
    }

    /// Sends a keepalive probe on this channel. The peer answers with
    /// SUCCESS or FAILURE; either way the probe does not touch the idle
    /// timer.
    pub fn send_keepalive(&self) -> TetherResult<()> {
        self.submit(
            ChannelRequest::new(self.remote_id, ChannelRequestType::Keepalive, true).to_bytes(),
        )
    }

    /// Replies to an out-of-band request that asked for a reply.
    pub fn reply_request(&self, success: bool) -> TetherResult<()> {
        let payload = if success {
            ChannelSuccess::new(self.remote_id).to_bytes()
        } else {
            ChannelFailure::new(self.remote_id).to_bytes()
        };
        self.submit(payload)
    }

    fn submit(&self, payload: Vec<u8>) -> TetherResult<()> {
        self.outbound
            .send(payload)
            .map_err(|_| TetherError::Closed("transport writer gone".to_string()))
    }

    // Inbound-side entry points, called by the dispatcher.

    /// Completes the open handshake.
    pub(crate) fn handle_open_confirm(&self) {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        if *state == ChannelState::Opening {
            *state = ChannelState::Open;
        }
    }

    /// Delivers inbound payload, enforcing the receive window.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the peer overflows the window
    /// we granted; fatal to the transport.
    pub(crate) fn deliver_data(&self, data: Vec<u8>) -> TetherResult<()> {
        let mut in_window = self.in_window.lock().expect("channel window lock poisoned");
        let len = data.len() as u32;
        if len > *in_window {
            return Err(TetherError::Protocol(format!(
                "Peer overflowed receive window on channel {}: {} > {}",
                self.local_id, len, *in_window
            )));
        }
        *in_window -= len;
        drop(in_window);
        self.buffer.write(data);
        Ok(())
    }

    /// Applies a WINDOW_ADJUST from the peer and wakes blocked writers.
    pub(crate) fn handle_window_adjust(&self, bytes: u32) {
        let mut window = self.out_window.lock().expect("channel window lock poisoned");
        *window = window.saturating_add(bytes);
        drop(window);
        self.out_cond.notify_all();
    }

    /// Handles the peer's EOF: buffered bytes drain, then reads see `Eof`.
    pub(crate) fn handle_remote_eof(&self) {
        self.buffer.eof();
    }

    /// Handles the peer's CLOSE. Returns whether the channel reached its
    /// terminal state.
    pub(crate) fn handle_remote_close(&self) -> bool {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        let done = match *state {
            ChannelState::Open => {
                *state = ChannelState::HalfClosedRx;
                false
            }
            ChannelState::Closing => {
                *state = ChannelState::Closed;
                true
            }
            ChannelState::HalfClosedRx | ChannelState::Opening => false,
            ChannelState::Closed => true,
        };
        drop(state);
        self.buffer.eof();
        done
    }

    /// Fails the channel because the transport died: reads drain then hit
    /// `Eof`, writes fail with `Closed`.
    pub(crate) fn fail_closed(&self) {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        *state = ChannelState::Closed;
        drop(state);
        self.buffer.eof();
        self.out_cond.notify_all();
    }

    /// Cancels every blocked operation on this channel.
    pub(crate) fn halt(&self) {
        self.buffer.halt();
        self.out_cond.notify_all();
    }

    /// Accounts for consumed bytes and replenishes the peer's window when
    /// half of the advertised window has been eaten since the last grant.
    fn record_consumed(&self, n: u32) -> TetherResult<()> {
        let mut pending = self
            .pending_adjust
            .lock()
            .expect("channel window lock poisoned");
        *pending += n;
        if *pending >= self.recv_initial_window / 2 {
            let grant = *pending;
            *pending = 0;
            drop(pending);

            let mut in_window = self.in_window.lock().expect("channel window lock poisoned");
            *in_window = in_window.saturating_add(grant);
            drop(in_window);

            self.submit(ChannelWindowAdjust::new(self.remote_id, grant).to_bytes())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state())
            .field("out_window", &self.out_window())
            .finish_non_exhaustive()
    }
}
