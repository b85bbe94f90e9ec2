//! Per-channel inbound buffer and idle timer.
//!
//! The buffer is an unbounded FIFO of byte slices shared between one
//! producer (the demultiplexer) and one consumer (the channel reader).
//! All mutation happens under a single mutex paired with a condition
//! variable; producers signal one waiter, and the buffer permits at most
//! one concurrent reader.
//!
//! Contract:
//! - [`Buffer::write`] appends a slice; the slice must not be mutated
//!   afterwards. Signals one waiter.
//! - [`Buffer::eof`] marks the buffer closed; reads drain the remaining
//!   bytes and then fail with `Eof`.
//! - [`Buffer::timeout`] wakes one waiter without closing; the waiter
//!   consults the idle timer to decide whether to fail with `Timeout`.
//! - [`Buffer::read`] blocks until at least one byte is available, the
//!   buffer closes, the idle timer fires, or a halt is requested. It
//!   returns as soon as any bytes are copied and never returns a
//!   zero-byte success. A successful read resets the idle timer; a
//!   timed-out read does not.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tether_platform::{TetherError, TetherResult};

/// A resettable idle timer.
///
/// The timer holds a duration and a deadline. Each [`IdleTimer::reset`]
/// pushes the deadline out by the duration; once the deadline passes while
/// a read is waiting, the timer fires, recording which side timed out.
/// The fired reason stays readable until the next reset.
#[derive(Debug)]
pub struct IdleTimer {
    state: Mutex<IdleState>,
    halted: AtomicBool,
}

#[derive(Debug)]
struct IdleState {
    duration: Option<Duration>,
    deadline: Option<Instant>,
    fired: Option<String>,
}

impl IdleTimer {
    /// Creates a disabled idle timer (reads block forever).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdleState {
                duration: None,
                deadline: None,
                fired: None,
            }),
            halted: AtomicBool::new(false),
        }
    }

    /// Creates an idle timer with the given duration already armed.
    pub fn with_duration(duration: Duration) -> Self {
        let timer = Self::new();
        timer.set_duration(duration);
        timer
    }

    /// Sets the idle duration and arms the deadline. A zero duration
    /// disables the timer.
    pub fn set_duration(&self, duration: Duration) {
        let mut state = self.state.lock().expect("idle timer lock poisoned");
        if duration.is_zero() {
            state.duration = None;
            state.deadline = None;
        } else {
            state.duration = Some(duration);
            state.deadline = Some(Instant::now() + duration);
        }
        state.fired = None;
    }

    /// Pushes the deadline out by the configured duration and clears any
    /// fired state. Called after each successful read.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("idle timer lock poisoned");
        if let Some(duration) = state.duration {
            state.deadline = Some(Instant::now() + duration);
        }
        state.fired = None;
    }

    /// Returns the side that timed out, if the timer has fired since the
    /// last reset.
    pub fn timed_out(&self) -> Option<String> {
        self.state
            .lock()
            .expect("idle timer lock poisoned")
            .fired
            .clone()
    }

    /// Requests cancellation: all blocked reads return `Cancelled`.
    pub fn halt_request(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Returns whether a halt has been requested.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .expect("idle timer lock poisoned")
            .deadline
    }

    fn fire(&self, side: &str) -> String {
        let mut state = self.state.lock().expect("idle timer lock poisoned");
        if state.fired.is_none() {
            state.fired = Some(side.to_string());
        }
        state.fired.clone().unwrap_or_else(|| side.to_string())
    }
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-channel inbound FIFO.
#[derive(Debug)]
pub struct Buffer {
    inner: Mutex<BufferInner>,
    cond: Condvar,
    idle: std::sync::Arc<IdleTimer>,
}

#[derive(Debug)]
struct BufferInner {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already consumed.
    head_offset: usize,
    closed: bool,
}

impl Buffer {
    /// Creates an empty, open buffer tied to an idle timer.
    pub fn new(idle: std::sync::Arc<IdleTimer>) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                chunks: VecDeque::new(),
                head_offset: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            idle,
        }
    }

    /// Returns the idle timer this buffer consults.
    pub fn idle_timer(&self) -> &std::sync::Arc<IdleTimer> {
        &self.idle
    }

    /// Makes `buf` available to the reader. The slice must not be mutated
    /// after this call. Wakes one waiter.
    pub fn write(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.chunks.push_back(buf);
        self.cond.notify_one();
    }

    /// Closes the buffer. Once the remaining bytes are drained, reads fail
    /// with `Eof`. Wakes one waiter.
    pub fn eof(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.closed = true;
        drop(inner);
        self.cond.notify_one();
    }

    /// Wakes one waiter without closing the buffer; the waiter consults
    /// the idle timer and fails with `Timeout` only if it has fired.
    pub fn timeout(&self) {
        self.cond.notify_one();
    }

    /// Requests cancellation: the halt is latched on the idle timer and
    /// every waiter is woken.
    pub fn halt(&self) {
        self.idle.halt_request();
        self.cond.notify_all();
    }

    /// Returns the number of unread bytes.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        let total: usize = inner.chunks.iter().map(|c| c.len()).sum();
        total - inner.head_offset
    }

    /// Returns whether no unread bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads into `dst`, blocking until at least one byte is copied, the
    /// buffer closes, the idle timer fires, or a halt is requested.
    ///
    /// # Errors
    ///
    /// - [`TetherError::Eof`] once the buffer is closed and drained
    /// - [`TetherError::Timeout`] when the idle timer fires with no data
    /// - [`TetherError::Cancelled`] after a halt request
    pub fn read(&self, dst: &mut [u8]) -> TetherResult<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let mut n = 0;

        loop {
            // Copy whatever is queued.
            while n < dst.len() {
                let Some(front) = inner.chunks.pop_front() else {
                    break;
                };
                let start = inner.head_offset;
                let take = (front.len() - start).min(dst.len() - n);
                dst[n..n + take].copy_from_slice(&front[start..start + take]);
                n += take;
                if start + take < front.len() {
                    // dst is full; keep the unread tail at the head.
                    inner.head_offset = start + take;
                    inner.chunks.push_front(front);
                    break;
                }
                inner.head_offset = 0;
            }

            if n > 0 {
                break;
            }

            if inner.closed {
                return Err(TetherError::Eof);
            }

            if self.idle.halted() {
                return Err(TetherError::Cancelled("buffer halted".to_string()));
            }

            if let Some(side) = self.idle.timed_out() {
                return Err(TetherError::Timeout(side));
            }

            // Nothing queued: wait for the producer, bounded by the idle
            // deadline if one is armed.
            match self.idle.deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let side = self.idle.fire("read");
                        return Err(TetherError::Timeout(side));
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .expect("buffer lock poisoned");
                    inner = guard;
                }
                None => {
                    inner = self.cond.wait(inner).expect("buffer lock poisoned");
                }
            }
        }

        drop(inner);
        self.idle.reset();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn buffer() -> Arc<Buffer> {
        Arc::new(Buffer::new(Arc::new(IdleTimer::new())))
    }

    #[test]
    fn test_read_available_bytes() {
        let buf = buffer();
        buf.write(vec![1, 2, 3]);

        let mut dst = [0u8; 8];
        let n = buf.read(&mut dst).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&dst[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_read_spans_chunks() {
        let buf = buffer();
        buf.write(vec![1, 2]);
        buf.write(vec![3, 4, 5]);

        let mut dst = [0u8; 8];
        assert_eq!(buf.read(&mut dst).unwrap(), 5);
        assert_eq!(&dst[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_short_destination_leaves_remainder() {
        let buf = buffer();
        buf.write(vec![1, 2, 3, 4]);

        let mut dst = [0u8; 2];
        assert_eq!(buf.read(&mut dst).unwrap(), 2);
        assert_eq!(dst, [1, 2]);
        assert_eq!(buf.len(), 2);

        assert_eq!(buf.read(&mut dst).unwrap(), 2);
        assert_eq!(dst, [3, 4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_blocking_read_woken_by_write() {
        let buf = buffer();
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut dst = [0u8; 8];
                let n = buf.read(&mut dst).unwrap();
                (n, dst)
            })
        };

        thread::sleep(Duration::from_millis(50));
        buf.write(vec![1, 2, 3]);

        let (n, dst) = reader.join().unwrap();
        assert_eq!(n, 3);
        assert_eq!(&dst[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_eof_drains_before_failing() {
        let buf = buffer();
        buf.write(vec![9, 9]);
        buf.eof();

        let mut dst = [0u8; 8];
        assert_eq!(buf.read(&mut dst).unwrap(), 2);
        assert!(matches!(buf.read(&mut dst), Err(TetherError::Eof)));
    }

    #[test]
    fn test_eof_wakes_blocked_reader() {
        let buf = buffer();
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut dst = [0u8; 4];
                buf.read(&mut dst)
            })
        };

        thread::sleep(Duration::from_millis(50));
        buf.eof();

        assert!(matches!(reader.join().unwrap(), Err(TetherError::Eof)));
    }

    #[test]
    fn test_idle_timeout_fails_read_but_not_buffer() {
        let idle = Arc::new(IdleTimer::with_duration(Duration::from_millis(50)));
        let buf = Buffer::new(Arc::clone(&idle));

        let mut dst = [0u8; 4];
        match buf.read(&mut dst) {
            Err(TetherError::Timeout(side)) => assert_eq!(side, "read"),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert_eq!(idle.timed_out().as_deref(), Some("read"));

        // The buffer stays usable: new data flows after the timeout.
        idle.reset();
        buf.write(vec![1]);
        assert_eq!(buf.read(&mut dst).unwrap(), 1);
    }

    #[test]
    fn test_successful_read_resets_idle_timer() {
        let idle = Arc::new(IdleTimer::with_duration(Duration::from_millis(200)));
        let buf = Buffer::new(Arc::clone(&idle));

        buf.write(vec![1]);
        let mut dst = [0u8; 1];
        buf.read(&mut dst).unwrap();
        assert!(idle.timed_out().is_none());

        // The deadline moved forward, so an immediate read of queued data
        // still succeeds.
        buf.write(vec![2]);
        assert_eq!(buf.read(&mut dst).unwrap(), 1);
    }

    #[test]
    fn test_timeout_signal_without_fired_timer_keeps_blocking() {
        let buf = buffer();
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut dst = [0u8; 4];
                buf.read(&mut dst)
            })
        };

        thread::sleep(Duration::from_millis(30));
        // Timer never armed, so this wake-up must not produce an error.
        buf.timeout();
        thread::sleep(Duration::from_millis(30));
        buf.write(vec![5]);

        assert_eq!(reader.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_halt_cancels_blocked_reader() {
        let buf = buffer();
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut dst = [0u8; 4];
                buf.read(&mut dst)
            })
        };

        thread::sleep(Duration::from_millis(50));
        buf.halt();

        assert!(matches!(
            reader.join().unwrap(),
            Err(TetherError::Cancelled(_))
        ));
    }

    #[test]
    fn test_zero_length_destination() {
        let buf = buffer();
        buf.write(vec![1]);
        let mut dst = [0u8; 0];
        assert_eq!(buf.read(&mut dst).unwrap(), 0);
        assert_eq!(buf.len(), 1);
    }
}
