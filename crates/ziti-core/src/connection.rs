//! Virtual connections.
//!
//! A [`ZitiConnection`] is one stream to a service, carried as `Data` frames
//! on a shared [`Channel`]. Payloads are protected by a [`SecretStream`] whose
//! keys are derived from the channel's key agreement and the connection id.
//!
//! The key agreement is made with the edge router, not with the service's
//! terminator. Payloads are therefore protected on the hop to the router and
//! the router can read them; traffic beyond it relies on the fabric's own
//! links. Applications that need confidentiality from the routers must
//! encrypt above this layer.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use ziti_controller::{NetworkSession, Service};
use ziti_crypto::{SecretStream, Tag};

use crate::channel::{Channel, MessageReceiver};
use crate::message::Message;
use crate::protocol::{ContentType, header};
use crate::{Result, ZitiError};

/// Largest plaintext carried in one `Data` frame.
pub const MAX_WRITE_CHUNK: usize = 64 * 1024;

enum Inbound {
    Frame(Message),
    Closed(ZitiError),
}

/// Channel-side half of a connection: forwards frames into a bounded queue.
///
/// Runs on the channel's receiver task, so it never waits for the reader.
/// A reader that lets its queue fill up loses the connection; the channel and
/// its other connections keep flowing.
struct ConnectionReceiver {
    queue: Mutex<Option<mpsc::Sender<Inbound>>>,
    overflow: OnceLock<ZitiError>,
}

impl ConnectionReceiver {
    fn new(queue: mpsc::Sender<Inbound>) -> Self {
        Self {
            queue: Mutex::new(Some(queue)),
            overflow: OnceLock::new(),
        }
    }

    fn queue(&self) -> Option<mpsc::Sender<Inbound>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detach(&self) -> Option<mpsc::Sender<Inbound>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Why the connection was detached, if its queue overflowed.
    fn overflow(&self) -> Option<ZitiError> {
        self.overflow.get().cloned()
    }
}

#[async_trait]
impl MessageReceiver for ConnectionReceiver {
    async fn receive(&self, msg: Message) -> Result<()> {
        let Some(queue) = self.queue() else {
            if self.overflow.get().is_some() {
                // Already reported; frames until the reader notices are dropped.
                return Ok(());
            }
            return Err(ZitiError::invalid_state("connection already detached"));
        };
        match queue.try_send(Inbound::Frame(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let err = ZitiError::invalid_state("inbound queue overflow");
                let _ = self.overflow.set(err.clone());
                // Dropping the sender lets the reader drain what is queued
                // and then observe the overflow.
                self.detach();
                Err(err)
            }
            Err(TrySendError::Closed(_)) => {
                Err(ZitiError::invalid_state("connection reader dropped"))
            }
        }
    }

    fn closed(&self, cause: &ZitiError) {
        if let Some(queue) = self.detach() {
            let _ = queue.try_send(Inbound::Closed(cause.clone()));
        }
    }
}

/// One virtual connection to a service.
pub struct ZitiConnection {
    conn_id: u32,
    service: String,
    channel: Arc<Channel>,
    stream: SecretStream,
    inbound: mpsc::Receiver<Inbound>,
    receiver: Arc<ConnectionReceiver>,
    send_seq: i32,
    pending: Vec<u8>,
    pending_pos: usize,
    eof: bool,
    closed: bool,
}

impl ZitiConnection {
    /// Open a virtual connection for `service` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ConnectionRejected`] if the router answers with
    /// anything but `StateConnected`, and channel errors if the channel
    /// closes or the reply does not arrive within `connect_timeout`.
    pub async fn connect(
        channel: Arc<Channel>,
        session: &NetworkSession,
        service: &Service,
        inbound_queue: usize,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(inbound_queue.max(1));
        let receiver = Arc::new(ConnectionReceiver::new(tx));
        let conn_id = channel.register_receiver(receiver.clone());

        match Self::handshake(&channel, conn_id, session, connect_timeout).await {
            Ok(stream) => {
                tracing::debug!(
                    "Connected to {} as conn {} on channel {}",
                    service.name,
                    conn_id,
                    channel.id()
                );
                Ok(Self {
                    conn_id,
                    service: service.name.clone(),
                    channel,
                    stream,
                    inbound: rx,
                    receiver,
                    send_seq: 0,
                    pending: Vec::new(),
                    pending_pos: 0,
                    eof: false,
                    closed: false,
                })
            }
            Err(e) => {
                channel.deregister_receiver(conn_id);
                Err(e)
            }
        }
    }

    async fn handshake(
        channel: &Channel,
        conn_id: u32,
        session: &NetworkSession,
        connect_timeout: Duration,
    ) -> Result<SecretStream> {
        let keys = channel.session_pair(conn_id)?;
        let mut stream = SecretStream::new(&keys)?;
        let local_header = stream.header()?;

        let request = Message::connect(conn_id, &session.token, &local_header);
        let reply = channel
            .send_and_wait_timeout(request, connect_timeout)
            .await?;

        match reply.content_type {
            ContentType::StateConnected => {
                let peer_header = reply.header(header::PUBLIC_KEY).ok_or_else(|| {
                    ZitiError::invalid_response("StateConnected without stream header")
                })?;
                stream.init(peer_header)?;
                Ok(stream)
            }
            _ => Err(ZitiError::ConnectionRejected(
                String::from_utf8_lossy(&reply.body).into_owned(),
            )),
        }
    }

    /// Connection id on the channel.
    #[must_use]
    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    /// Name of the dialed service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The channel carrying this connection.
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Whether the read side has ended.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn next_seq(&mut self) -> i32 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    async fn send_payload(&mut self, payload: &[u8], tag: Tag) -> Result<()> {
        let frame = self.stream.encrypt_with_tag(payload, tag);
        let seq = self.next_seq();
        self.channel
            .send(Message::data(self.conn_id, seq, frame))
            .await?;
        Ok(())
    }

    /// Encrypt and send `data`, split into frames of at most
    /// [`MAX_WRITE_CHUNK`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidState`] after [`close`](Self::close) and
    /// channel errors if the channel is gone.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ZitiError::invalid_state("connection is closed"));
        }
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            self.send_payload(chunk, Tag::Message).await?;
        }
        Ok(())
    }

    /// Alias of [`write`](Self::write); every write is complete.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.write(data).await
    }

    /// Read the next decrypted payload. `Ok(None)` means the peer ended the
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::DecryptionFailed`] for a corrupt frame, the
    /// channel's close cause if the channel went away, and
    /// [`ZitiError::InvalidState`] once the queued frames are drained if the
    /// inbound queue overflowed.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending_pos < self.pending.len() {
            let rest = self.pending.split_off(self.pending_pos);
            self.pending.clear();
            self.pending_pos = 0;
            return Ok(Some(rest));
        }

        loop {
            if self.eof {
                return Ok(None);
            }
            let Some(inbound) = self.inbound.recv().await else {
                self.eof = true;
                return Err(self.detached().await);
            };

            let msg = match inbound {
                Inbound::Frame(msg) => msg,
                Inbound::Closed(cause) => {
                    self.eof = true;
                    return Err(cause);
                }
            };

            match msg.content_type {
                ContentType::Data => {
                    if msg.body.is_empty() {
                        continue;
                    }
                    let (plaintext, tag) = self.stream.decrypt_with_tag(&msg.body)?;
                    if tag == Tag::Final {
                        tracing::trace!("conn {} received FINAL", self.conn_id);
                        self.eof = true;
                    }
                    if plaintext.is_empty() {
                        continue;
                    }
                    return Ok(Some(plaintext));
                }
                ContentType::StateClosed => {
                    tracing::debug!("conn {} closed by peer", self.conn_id);
                    self.eof = true;
                }
                other => {
                    tracing::trace!("conn {} ignoring {}", self.conn_id, other);
                }
            }
        }
    }

    async fn detached(&mut self) -> ZitiError {
        let Some(err) = self.receiver.overflow() else {
            return ZitiError::channel_closed("connection detached from channel");
        };
        tracing::warn!(
            "conn {} to {} fell behind its inbound queue, closing",
            self.conn_id,
            self.service
        );
        if !self.closed {
            self.closed = true;
            self.channel.deregister_receiver(self.conn_id);
            if !self.channel.is_closed() {
                let _ = self
                    .channel
                    .send(Message::state_closed(self.conn_id, "inbound queue overflow"))
                    .await;
            }
        }
        err
    }

    /// Read into `buf`, buffering any excess. Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending_pos >= self.pending.len() {
            match self.read().await? {
                Some(data) => {
                    self.pending = data;
                    self.pending_pos = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    /// Close the connection: send a FINAL frame and `StateClosed`, then
    /// detach from the channel. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns channel errors from sending the close frames; the connection
    /// is detached regardless.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = if self.channel.is_closed() {
            Ok(())
        } else {
            let fin = self.send_payload(&[], Tag::Final).await;
            let closed = self
                .channel
                .send(Message::state_closed(self.conn_id, ""))
                .await
                .map(|_| ());
            fin.and(closed)
        };

        self.channel.deregister_receiver(self.conn_id);
        tracing::debug!("conn {} to {} closed", self.conn_id, self.service);
        result
    }
}

impl Drop for ZitiConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.channel.deregister_receiver(self.conn_id);
        if !self.channel.is_closed() {
            if let Err(e) = self
                .channel
                .try_send(Message::state_closed(self.conn_id, ""))
            {
                tracing::debug!("conn {} dropped without StateClosed: {}", self.conn_id, e);
            }
        }
    }
}

impl std::fmt::Debug for ZitiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZitiConnection")
            .field("conn_id", &self.conn_id)
            .field("service", &self.service)
            .field("channel", &self.channel.id())
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

/// `std::io` adapter over a [`ZitiConnection`].
///
/// Every call blocks the current thread on the SDK runtime, so it must not
/// be used from inside an async task.
pub struct BlockingConnection {
    conn: ZitiConnection,
    handle: Handle,
}

impl BlockingConnection {
    /// Wrap `conn`, driving it on `handle`.
    #[must_use]
    pub fn new(conn: ZitiConnection, handle: Handle) -> Self {
        Self { conn, handle }
    }

    /// The wrapped connection.
    #[must_use]
    pub fn get_ref(&self) -> &ZitiConnection {
        &self.conn
    }

    /// Unwrap into the async connection.
    #[must_use]
    pub fn into_inner(self) -> ZitiConnection {
        self.conn
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// See [`ZitiConnection::close`].
    pub fn close(&mut self) -> std::io::Result<()> {
        let conn = &mut self.conn;
        self.handle.block_on(conn.close()).map_err(Into::into)
    }
}

impl std::io::Read for BlockingConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let conn = &mut self.conn;
        self.handle.block_on(conn.read_into(buf)).map_err(Into::into)
    }
}

impl std::io::Write for BlockingConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let conn = &mut self.conn;
        self.handle.block_on(conn.write(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
