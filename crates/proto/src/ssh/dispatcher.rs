//! Message dispatcher: the transport's two long-running tasks.
//!
//! The **outbound task** drains a queue of framed payloads and writes them
//! through the [`PacketWriter`]; every writer in the process submits
//! through the queue, so the write path is serialized.
//!
//! The **inbound task** reads packets, decodes the connection-protocol
//! message, and routes it to the owning channel: DATA into the channel's
//! buffer, WINDOW_ADJUST onto its window, EOF/CLOSE into its state
//! machine, REQUEST to its request consumer. OPEN_CONFIRMATION and
//! OPEN_FAILURE complete pending opens; a confirmation that lands after
//! its open was cancelled gets an immediate CLOSE back.
//!
//! A fatal error on the inbound path (protocol violation, MAC failure,
//! stream loss) fails every channel and every pending open.

use crate::ssh::channel::{Channel, ChannelState};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest, ChannelType,
    ChannelWindowAdjust, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
use crate::ssh::message::MessageType;
use crate::ssh::stream::{PacketReader, PacketWriter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_platform::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum PendingOpen {
    /// The opener is waiting on this ticket. The inbound task builds and
    /// registers the channel before completing it, so no DATA can slip
    /// past an unregistered channel.
    Waiting(oneshot::Sender<TetherResult<Arc<Channel>>>),
    /// The opener gave up (deadline); a late confirmation is closed on
    /// arrival.
    Cancelled,
}

#[derive(Default)]
struct Routes {
    channels: HashMap<u32, Arc<Channel>>,
    request_txs: HashMap<u32, mpsc::UnboundedSender<ChannelRequest>>,
    pending_opens: HashMap<u32, PendingOpen>,
}

/// Routes connection-protocol messages between the transport tasks and
/// the channels multiplexed on top of it.
pub struct Dispatcher {
    routes: Arc<Mutex<Routes>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    next_channel_id: AtomicU32,
    closed: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the outbound and inbound tasks over the split transport.
    ///
    /// `inbound_opens` receives peer-initiated CHANNEL_OPENs; if the
    /// receiver is dropped they are refused.
    pub fn start<R, W>(
        reader: PacketReader<R>,
        writer: PacketWriter<W>,
        inbound_opens: mpsc::UnboundedSender<ChannelOpen>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(Self::outbound_loop(writer, outbound_rx));
        let reader_handle = tokio::spawn(Self::inbound_loop(
            reader,
            Arc::clone(&routes),
            outbound_tx.clone(),
            inbound_opens,
            Arc::clone(&closed),
        ));

        Self {
            routes,
            outbound_tx,
            next_channel_id: AtomicU32::new(0),
            closed,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }

    /// Returns a handle for submitting framed payloads to the outbound
    /// task.
    pub fn outbound(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.outbound_tx.clone()
    }

    /// Returns whether the transport has failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of live channels.
    pub fn channel_count(&self) -> usize {
        self.routes.lock().expect("routes lock poisoned").channels.len()
    }

    /// Opens a new channel, bounded by `deadline`.
    ///
    /// On expiry the pending open is cancelled and any late confirmation
    /// is answered with an immediate CLOSE.
    ///
    /// # Errors
    ///
    /// - [`TetherError::Timeout`] when the deadline expires
    /// - [`TetherError::Closed`] when the peer refuses the open or the
    ///   transport dies first
    pub async fn open_channel(
        &self,
        channel_type: ChannelType,
        deadline: Duration,
    ) -> TetherResult<Arc<Channel>> {
        if self.is_closed() {
            return Err(TetherError::Closed("transport is down".to_string()));
        }

        let local_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let (ticket_tx, ticket_rx) = oneshot::channel();

        {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            routes
                .pending_opens
                .insert(local_id, PendingOpen::Waiting(ticket_tx));
        }

        let open = ChannelOpen::new(
            channel_type,
            local_id,
            DEFAULT_WINDOW_SIZE,
            DEFAULT_MAX_PACKET_SIZE,
        );
        if self.outbound_tx.send(open.to_bytes()).is_err() {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            routes.pending_opens.remove(&local_id);
            return Err(TetherError::Closed("transport writer gone".to_string()));
        }

        match tokio::time::timeout(deadline, ticket_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TetherError::Closed("transport is down".to_string())),
            Err(_) => {
                let mut routes = self.routes.lock().expect("routes lock poisoned");
                if let Some(pending) = routes.pending_opens.get_mut(&local_id) {
                    *pending = PendingOpen::Cancelled;
                }
                Err(TetherError::Timeout(format!(
                    "Channel open timed out after {:?}",
                    deadline
                )))
            }
        }
    }

    /// Allocates a fresh local channel id.
    pub fn allocate_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Inserts a fully-constructed channel plus its request route.
    pub fn insert_channel(
        &self,
        channel: Arc<Channel>,
        request_tx: mpsc::UnboundedSender<ChannelRequest>,
    ) {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        routes.request_txs.insert(channel.local_id(), request_tx);
        routes.channels.insert(channel.local_id(), channel);
    }

    /// Removes a channel from the routing tables.
    pub fn remove_channel(&self, local_id: u32) {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        routes.channels.remove(&local_id);
        routes.request_txs.remove(&local_id);
    }

    /// Fails every channel and pending open, and stops both tasks.
    pub fn shutdown(&mut self) {
        Self::fail_all(&self.routes, &self.closed);
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_handle.take() {
            handle.abort();
        }
    }

    fn fail_all(routes: &Arc<Mutex<Routes>>, closed: &Arc<AtomicBool>) {
        closed.store(true, Ordering::SeqCst);
        let mut routes = routes.lock().expect("routes lock poisoned");
        for channel in routes.channels.values() {
            channel.fail_closed();
        }
        routes.channels.clear();
        routes.request_txs.clear();
        for (_, pending) in routes.pending_opens.drain() {
            if let PendingOpen::Waiting(tx) = pending {
                let _ = tx.send(Err(TetherError::Closed(
                    "transport closed".to_string(),
                )));
            }
        }
    }

    async fn outbound_loop<W: AsyncWrite + Unpin>(
        mut writer: PacketWriter<W>,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        debug!("Outbound writer task started");
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(e) = writer.write_payload(&payload).await {
                warn!("Outbound write failed: {}", e);
                break;
            }
        }
        debug!("Outbound writer task stopped");
    }

    async fn inbound_loop<R: AsyncRead + Unpin>(
        mut reader: PacketReader<R>,
        routes: Arc<Mutex<Routes>>,
        outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound_opens: mpsc::UnboundedSender<ChannelOpen>,
        closed: Arc<AtomicBool>,
    ) {
        debug!("Inbound dispatcher task started");
        loop {
            let payload = match reader.read_payload().await {
                Ok(payload) => payload,
                Err(e) => {
                    match e {
                        TetherError::Eof => debug!("Transport stream ended"),
                        _ => warn!("Transport read failed: {}", e),
                    }
                    break;
                }
            };

            if payload.is_empty() {
                continue;
            }

            if let Err(e) =
                Self::route(&routes, &outbound_tx, &inbound_opens, &payload)
            {
                if e.is_fatal_to_transport() {
                    warn!("Fatal dispatch error: {}", e);
                    break;
                }
                debug!("Dispatch error: {}", e);
            }
        }

        Self::fail_all(&routes, &closed);
        debug!("Inbound dispatcher task stopped");
    }

    fn route(
        routes: &Arc<Mutex<Routes>>,
        outbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
        inbound_opens: &mpsc::UnboundedSender<ChannelOpen>,
        payload: &[u8],
    ) -> TetherResult<()> {
        let channel_for = |id: u32| -> Option<Arc<Channel>> {
            routes
                .lock()
                .expect("routes lock poisoned")
                .channels
                .get(&id)
                .cloned()
        };

        match MessageType::from_u8(payload[0]) {
            Some(MessageType::ChannelData) => {
                let msg = ChannelData::from_bytes(payload)?;
                match channel_for(msg.recipient_channel()) {
                    Some(channel) => channel.deliver_data(msg.data().to_vec())?,
                    None => warn!("DATA for unknown channel {}", msg.recipient_channel()),
                }
            }

            Some(MessageType::ChannelExtendedData) => {
                // Stderr-class traffic has no consumer on these streams.
                debug!("Discarding CHANNEL_EXTENDED_DATA");
            }

            Some(MessageType::ChannelWindowAdjust) => {
                let msg = ChannelWindowAdjust::from_bytes(payload)?;
                if let Some(channel) = channel_for(msg.recipient_channel()) {
                    channel.handle_window_adjust(msg.bytes_to_add());
                }
            }

            Some(MessageType::ChannelEof) => {
                let msg = ChannelEof::from_bytes(payload)?;
                if let Some(channel) = channel_for(msg.recipient_channel()) {
                    channel.handle_remote_eof();
                }
            }

            Some(MessageType::ChannelClose) => {
                let msg = ChannelClose::from_bytes(payload)?;
                if let Some(channel) = channel_for(msg.recipient_channel()) {
                    if channel.handle_remote_close() {
                        let mut routes = routes.lock().expect("routes lock poisoned");
                        routes.channels.remove(&msg.recipient_channel());
                        routes.request_txs.remove(&msg.recipient_channel());
                    }
                }
            }

            Some(MessageType::ChannelRequest) => {
                let msg = ChannelRequest::from_bytes(payload)?;
                let tx = {
                    let routes = routes.lock().expect("routes lock poisoned");
                    routes.request_txs.get(&msg.recipient_channel()).cloned()
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!(
                        "REQUEST for channel {} without consumer",
                        msg.recipient_channel()
                    ),
                }
            }

            Some(MessageType::ChannelSuccess) | Some(MessageType::ChannelFailure) => {
                // Replies to our keepalive probes; nothing waits on them.
                debug!("Channel request reply received");
            }

            Some(MessageType::ChannelOpenConfirmation) => {
                let msg = ChannelOpenConfirmation::from_bytes(payload)?;
                let pending = {
                    let mut routes = routes.lock().expect("routes lock poisoned");
                    routes.pending_opens.remove(&msg.recipient_channel())
                };
                match pending {
                    Some(PendingOpen::Waiting(tx)) => {
                        let (request_tx, request_rx) = mpsc::unbounded_channel();
                        let channel = Arc::new(Channel::new(
                            msg.recipient_channel(),
                            msg.sender_channel(),
                            DEFAULT_WINDOW_SIZE,
                            msg.initial_window_size(),
                            msg.maximum_packet_size(),
                            ChannelState::Opening,
                            outbound_tx.clone(),
                            request_rx,
                        ));
                        channel.handle_open_confirm();
                        {
                            let mut routes = routes.lock().expect("routes lock poisoned");
                            routes
                                .channels
                                .insert(msg.recipient_channel(), Arc::clone(&channel));
                            routes.request_txs.insert(msg.recipient_channel(), request_tx);
                        }

                        if tx.send(Ok(channel)).is_err() {
                            // Opener vanished between cancel and delivery.
                            let mut routes = routes.lock().expect("routes lock poisoned");
                            routes.channels.remove(&msg.recipient_channel());
                            routes.request_txs.remove(&msg.recipient_channel());
                            drop(routes);
                            let _ = outbound_tx
                                .send(ChannelClose::new(msg.sender_channel()).to_bytes());
                        }
                    }
                    Some(PendingOpen::Cancelled) => {
                        debug!(
                            "Late OPEN_CONFIRMATION for cancelled open {}; closing",
                            msg.recipient_channel()
                        );
                        let _ = outbound_tx
                            .send(ChannelClose::new(msg.sender_channel()).to_bytes());
                    }
                    None => warn!(
                        "OPEN_CONFIRMATION for unknown channel {}",
                        msg.recipient_channel()
                    ),
                }
            }

            Some(MessageType::ChannelOpenFailure) => {
                let msg = ChannelOpenFailure::from_bytes(payload)?;
                let pending = {
                    let mut routes = routes.lock().expect("routes lock poisoned");
                    routes.pending_opens.remove(&msg.recipient_channel())
                };
                if let Some(PendingOpen::Waiting(tx)) = pending {
                    let _ = tx.send(Err(TetherError::Closed(format!(
                        "Channel open refused: {}",
                        msg.description()
                    ))));
                }
            }

            Some(MessageType::ChannelOpen) => {
                let msg = ChannelOpen::from_bytes(payload)?;
                let sender_channel = msg.sender_channel();
                if inbound_opens.send(msg).is_err() {
                    let refuse = ChannelOpenFailure::new(
                        sender_channel,
                        ChannelOpenFailureReason::AdministrativelyProhibited,
                    );
                    let _ = outbound_tx.send(refuse.to_bytes());
                }
            }

            Some(MessageType::GlobalRequest) => {
                // want_reply byte sits after the request name.
                let mut offset = 1;
                let name = crate::ssh::wire::read_string(payload, &mut offset)?;
                let want_reply = crate::ssh::wire::read_bool(payload, &mut offset)?;
                debug!("Refusing global request '{}'", name);
                if want_reply {
                    let _ = outbound_tx.send(vec![MessageType::RequestFailure as u8]);
                }
            }

            Some(MessageType::Ignore) | Some(MessageType::Debug) => {}

            Some(MessageType::Disconnect) => {
                return Err(TetherError::Protocol(
                    "Peer sent SSH_MSG_DISCONNECT".to_string(),
                ));
            }

            other => {
                debug!("Unrouted message: {:?}", other);
            }
        }

        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::message::MessageType;
    use tokio::io::duplex;

    fn start_pair() -> (
        Dispatcher,
        PacketWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        PacketReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        mpsc::UnboundedReceiver<ChannelOpen>,
    ) {
        let (near, far) = duplex(64 * 1024);
        let (near_rd, near_wr) = tokio::io::split(near);
        let (far_rd, far_wr) = tokio::io::split(far);

        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::start(
            PacketReader::new(near_rd),
            PacketWriter::new(near_wr),
            opens_tx,
        );
        (
            dispatcher,
            PacketWriter::new(far_wr),
            PacketReader::new(far_rd),
            opens_rx,
        )
    }

    #[tokio::test]
    async fn test_open_channel_confirmed() {
        let (dispatcher, mut peer_wr, mut peer_rd, _opens) = start_pair();

        let open_task = tokio::spawn(async move {
            dispatcher
                .open_channel(ChannelType::CustomInprocStream, Duration::from_secs(5))
                .await
                .map(|ch| (ch.local_id(), ch.remote_id()))
        });

        // Peer sees the OPEN and confirms.
        let payload = peer_rd.read_payload().await.unwrap();
        assert_eq!(payload[0], MessageType::ChannelOpen as u8);
        let open = ChannelOpen::from_bytes(&payload).unwrap();
        assert_eq!(open.channel_type().name(), "custom-inproc-stream");

        let confirm =
            ChannelOpenConfirmation::new(open.sender_channel(), 42, 1 << 20, 32 * 1024);
        peer_wr.write_payload(&confirm.to_bytes()).await.unwrap();

        let (local_id, remote_id) = open_task.await.unwrap().unwrap();
        assert_eq!(local_id, open.sender_channel());
        assert_eq!(remote_id, 42);
    }

    #[tokio::test]
    async fn test_open_channel_refused() {
        let (dispatcher, mut peer_wr, mut peer_rd, _opens) = start_pair();

        let open_task = tokio::spawn(async move {
            dispatcher
                .open_channel(ChannelType::Session, Duration::from_secs(5))
                .await
                .map(|_| ())
        });

        let payload = peer_rd.read_payload().await.unwrap();
        let open = ChannelOpen::from_bytes(&payload).unwrap();
        let refuse = ChannelOpenFailure::new(
            open.sender_channel(),
            ChannelOpenFailureReason::AdministrativelyProhibited,
        );
        peer_wr.write_payload(&refuse.to_bytes()).await.unwrap();

        assert!(matches!(
            open_task.await.unwrap(),
            Err(TetherError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_open_channel_deadline_and_late_confirmation() {
        let (dispatcher, mut peer_wr, mut peer_rd, _opens) = start_pair();

        let result = dispatcher
            .open_channel(ChannelType::Session, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TetherError::Timeout(_))));

        // A late confirmation is answered with an immediate CLOSE.
        let payload = peer_rd.read_payload().await.unwrap();
        let open = ChannelOpen::from_bytes(&payload).unwrap();
        let confirm =
            ChannelOpenConfirmation::new(open.sender_channel(), 9, 1 << 20, 32 * 1024);
        peer_wr.write_payload(&confirm.to_bytes()).await.unwrap();

        let reply = peer_rd.read_payload().await.unwrap();
        assert_eq!(reply[0], MessageType::ChannelClose as u8);
    }

    #[tokio::test]
    async fn test_data_routed_to_channel() {
        let (dispatcher, mut peer_wr, mut peer_rd, _opens) = start_pair();

        let handle = tokio::spawn(async move {
            let channel = dispatcher
                .open_channel(ChannelType::CustomInprocStream, Duration::from_secs(5))
                .await
                .unwrap();
            let channel_clone = Arc::clone(&channel);
            let read = tokio::task::spawn_blocking(move || {
                let mut dst = [0u8; 16];
                let n = channel_clone.read(&mut dst).unwrap();
                dst[..n].to_vec()
            });
            (dispatcher, read.await.unwrap())
        });

        let payload = peer_rd.read_payload().await.unwrap();
        let open = ChannelOpen::from_bytes(&payload).unwrap();
        let confirm =
            ChannelOpenConfirmation::new(open.sender_channel(), 7, 1 << 20, 32 * 1024);
        peer_wr.write_payload(&confirm.to_bytes()).await.unwrap();

        let data = ChannelData::new(open.sender_channel(), b"routed".to_vec());
        peer_wr.write_payload(&data.to_bytes()).await.unwrap();

        let (_dispatcher, bytes) = handle.await.unwrap();
        assert_eq!(bytes, b"routed");
    }

    #[tokio::test]
    async fn test_transport_loss_fails_channels() {
        let (dispatcher, mut peer_wr, mut peer_rd, _opens) = start_pair();

        let open_fut = dispatcher.open_channel(ChannelType::Session, Duration::from_secs(5));
        let confirm_fut = async {
            let payload = peer_rd.read_payload().await.unwrap();
            let open = ChannelOpen::from_bytes(&payload).unwrap();
            let confirm =
                ChannelOpenConfirmation::new(open.sender_channel(), 3, 1 << 20, 32 * 1024);
            peer_wr.write_payload(&confirm.to_bytes()).await.unwrap();
        };
        let (channel, _) = tokio::join!(open_fut, confirm_fut);
        let channel = channel.unwrap();
        assert_eq!(dispatcher.channel_count(), 1);

        // Drop the peer side: the inbound task sees EOF and fails all.
        drop(peer_wr);
        drop(peer_rd);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.channel_count(), 0);

        let mut dst = [0u8; 4];
        assert!(matches!(channel.read(&mut dst), Err(TetherError::Eof)));
    }
}
