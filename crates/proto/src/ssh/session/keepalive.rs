//! Keepalive machinery.
//!
//! Two pieces:
//! - [`KeepaliveTask`], an interval-driven heartbeat that pushes
//!   SSH_MSG_IGNORE traffic through the transport so NAT mappings and
//!   half-dead TCP connections get noticed;
//! - [`discard_requests_except_keepalives`], the per-channel request
//!   consumer the supervisor attaches: it answers keepalive probes that
//!   want a reply and discards everything else.
//!
//! Keepalive traffic never resets a channel's idle timer; only payload
//! reads do.

use crate::ssh::channel::Channel;
use crate::ssh::connection::{ChannelRequest, ChannelRequestType};
use crate::ssh::message::MessageType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_platform::TetherResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interval-driven keepalive sender.
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a keepalive task (not yet started).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Starts the task; `send_fn` submits one keepalive message. The task
    /// stops itself when `send_fn` fails.
    pub fn start<F, Fut>(&mut self, send_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = TetherResult<()>> + Send + 'static,
    {
        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!("Keepalive task started with interval {:?}", interval);

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = send_fn().await {
                    warn!("Keepalive failed: {} - stopping task", e);
                    break;
                }
            }

            debug!("Keepalive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE message with `data_len` random bytes.
///
/// ```text
/// byte    SSH_MSG_IGNORE (2)
/// string  data
/// ```
pub fn create_keepalive_message(data_len: usize) -> Vec<u8> {
    use rand::Rng;

    let mut msg = Vec::with_capacity(1 + 4 + data_len);
    msg.push(MessageType::Ignore as u8);
    msg.extend_from_slice(&(data_len as u32).to_be_bytes());

    if data_len > 0 {
        let mut rng = rand::thread_rng();
        let random_data: Vec<u8> = (0..data_len).map(|_| rng.gen()).collect();
        msg.extend_from_slice(&random_data);
    }

    msg
}

/// Consumes a channel's out-of-band requests until the transport drops
/// the channel: keepalive probes that want a reply get SUCCESS, everything
/// else is discarded.
pub async fn discard_requests_except_keepalives(
    channel: Arc<Channel>,
    mut requests: mpsc::UnboundedReceiver<ChannelRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request.request_type() {
            ChannelRequestType::Keepalive => {
                if request.want_reply() {
                    if channel.reply_request(true).is_err() {
                        break;
                    }
                }
            }
            other => {
                debug!(
                    "Discarding '{}' request on channel {}",
                    other.name(),
                    channel.local_id()
                );
            }
        }
    }
    debug!("Request consumer for channel {} done", channel.local_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::channel::ChannelState;

    #[test]
    fn test_create_keepalive_message_format() {
        let msg = create_keepalive_message(0);
        assert_eq!(msg[0], MessageType::Ignore as u8);
        assert_eq!(msg.len(), 1 + 4);

        let data_len = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
        assert_eq!(data_len, 0);
    }

    #[test]
    fn test_create_keepalive_message_with_data() {
        let msg = create_keepalive_message(32);
        assert_eq!(msg[0], MessageType::Ignore as u8);
        assert_eq!(msg.len(), 1 + 4 + 32);
    }

    #[test]
    fn test_keepalive_task_creation() {
        let task = KeepaliveTask::new(Duration::from_secs(60));
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_keepalive_task_lifecycle() {
        use std::sync::atomic::AtomicU32;

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut task = KeepaliveTask::new(Duration::from_millis(50));
        task.start(move || {
            let counter = Arc::clone(&counter_clone);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(180)).await;
        task.stop();

        let count = counter.load(Ordering::Relaxed);
        assert!(count >= 2, "Expected at least 2 keepalives, got {}", count);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_consumer_replies_to_keepalives_only() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (_inner_req_tx, inner_req_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel::new(
            0,
            100,
            1 << 20,
            1 << 20,
            32 * 1024,
            ChannelState::Open,
            out_tx,
            inner_req_rx,
        ));

        let consumer = tokio::spawn(discard_requests_except_keepalives(
            Arc::clone(&channel),
            req_rx,
        ));

        req_tx
            .send(ChannelRequest::new(0, ChannelRequestType::Keepalive, true))
            .unwrap();
        req_tx
            .send(ChannelRequest::new(
                0,
                ChannelRequestType::ExitStatus { exit_status: 0 },
                true,
            ))
            .unwrap();
        drop(req_tx);

        consumer.await.unwrap();

        // Exactly one reply went out, for the keepalive.
        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply[0], MessageType::ChannelSuccess as u8);
        assert!(out_rx.try_recv().is_err());
    }
}
