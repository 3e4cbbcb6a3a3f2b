//! Edge channel: many virtual connections over one router transport.
//!
//! A channel owns one transport to an edge router, split into a sender task
//! (sole writer) and a receiver task (sole reader). Outbound frames get a
//! channel sequence number at enqueue time; inbound frames are routed to a
//! reply waiter by `ReplyFor`, else to a registered [`MessageReceiver`] by
//! `ConnId`, else dropped.
//!
//! ```text
//!  send / send_and_flush / send_and_wait
//!        │ (enqueue lock: seq assignment + queue order)
//!        ▼
//!   ┌─────────┐   frames    ┌──────────┐
//!   │ sender  │ ──────────▶ │ transport│
//!   └─────────┘             └──────────┘
//!                                │
//!   ┌─────────┐   frames         │
//!   │receiver │ ◀────────────────┘
//!   └─────────┘
//!     │  replyFor → waiter   connId → MessageReceiver   else drop
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use ziti_crypto::{KxKeyPair, KxRole, SessionPair, SharedKeys};
use ziti_transport::{BoxedTransport, Dialer};

use crate::identity::ZitiIdentity;
use crate::message::Message;
use crate::meter::RateMeter;
use crate::protocol::{ContentType, header};
use crate::{Result, ZitiError};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Receives frames addressed to one virtual connection.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Handle one inbound frame.
    ///
    /// Runs on the channel's receiver task, so it must only do bounded work.
    /// Errors are logged and do not affect the channel.
    async fn receive(&self, msg: Message) -> Result<()>;

    /// The channel closed with `cause`.
    fn closed(&self, _cause: &ZitiError) {}
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on the hello exchange
    pub hello_timeout: Duration,
    /// Send queue depth
    pub send_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(10),
            send_queue: 16,
        }
    }
}

type CloseListener = Box<dyn FnOnce() + Send>;

/// A live channel to one edge router.
pub struct Channel {
    id: u64,
    addr: String,
    sequencer: AtomicI32,
    receiver_seq: AtomicU32,
    receivers: Mutex<HashMap<u32, Arc<dyn MessageReceiver>>>,
    waiters: DashMap<i32, oneshot::Sender<Result<Message>>>,
    flushers: DashMap<i32, oneshot::Sender<Result<()>>>,
    enqueue_lock: tokio::sync::Mutex<()>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    closed: AtomicBool,
    close_cause: OnceLock<ZitiError>,
    close_listeners: Mutex<Vec<CloseListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    keys: OnceLock<SharedKeys>,
    up: RateMeter,
    down: RateMeter,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Channel {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Dial an edge router and complete the hello handshake.
    ///
    /// # Errors
    ///
    /// - [`ZitiError::NoSessionToken`] if the identity is not logged in
    /// - [`ZitiError::EdgeRouterUnavailable`] if the router cannot be reached
    ///   or refuses the hello
    /// - [`ZitiError::InvalidResponse`] if the hello reply is not a RESULT
    pub async fn dial(
        dialer: &dyn Dialer,
        addr: &str,
        identity: &ZitiIdentity,
        config: &ChannelConfig,
    ) -> Result<Arc<Self>> {
        let token = identity.session_token().ok_or(ZitiError::NoSessionToken)?;

        let transport = dialer
            .dial(addr)
            .await
            .map_err(|e| ZitiError::edge_router_unavailable(format!("{addr}: {e}")))?;
        let channel = Self::start(addr, transport, config);

        let kx = KxKeyPair::generate();
        let hello = Message::hello(identity.name(), &token, &kx.public_key());

        let reply = match channel.send_and_wait_timeout(hello, config.hello_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                channel.close_with(e.clone());
                return Err(ZitiError::edge_router_unavailable(format!(
                    "{addr}: hello failed: {e}"
                )));
            }
        };

        if reply.content_type != ContentType::Result {
            channel.close();
            return Err(ZitiError::invalid_response(format!(
                "{addr}: hello answered with {}",
                reply.content_type
            )));
        }
        if reply.bool_header(header::RESULT_SUCCESS) != Some(true) {
            channel.close();
            return Err(ZitiError::edge_router_unavailable(format!(
                "{addr}: hello rejected: {}",
                String::from_utf8_lossy(&reply.body)
            )));
        }

        let keys = reply
            .header(header::PUBLIC_KEY)
            .ok_or_else(|| ZitiError::invalid_response(format!("{addr}: hello result has no key")))
            .and_then(|pk| kx.agree(pk, KxRole::Client).map_err(ZitiError::from));
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };
        // Only this call can set the keys of a freshly started channel.
        let _ = channel.keys.set(keys);

        tracing::info!("Channel {} established to {}", channel.id, addr);
        Ok(channel)
    }

    /// Start a channel over an already connected transport, without the
    /// hello exchange.
    #[must_use]
    pub fn start(addr: &str, transport: BoxedTransport, config: &ChannelConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.send_queue.max(1));
        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.to_string(),
            sequencer: AtomicI32::new(1),
            receiver_seq: AtomicU32::new(1),
            receivers: Mutex::new(HashMap::new()),
            waiters: DashMap::new(),
            flushers: DashMap::new(),
            enqueue_lock: tokio::sync::Mutex::new(()),
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            close_cause: OnceLock::new(),
            close_listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            keys: OnceLock::new(),
            up: RateMeter::new(),
            down: RateMeter::new(),
        });

        let (reader, writer) = tokio::io::split(transport);
        let sender = tokio::spawn(channel.clone().run_sender(rx, writer));
        let receiver = tokio::spawn(channel.clone().run_receiver(reader));
        lock(&channel.tasks).extend([sender, receiver]);

        tracing::debug!("Channel {} started for {}", channel.id, addr);
        channel
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.close_with(ZitiError::channel_closed("closed locally"));
    }

    /// Close the channel recording `cause` as the reason.
    ///
    /// The first call stops both tasks, closes the send queue and transport,
    /// fires close listeners in registration order, and fails every pending
    /// waiter. Later calls do nothing.
    pub fn close_with(&self, cause: ZitiError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_cause.set(cause.clone());
        tracing::debug!("Channel {} to {} closing: {}", self.id, self.addr, cause);

        lock(&self.sender).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let listeners: Vec<CloseListener> = lock(&self.close_listeners).drain(..).collect();
        for listener in listeners {
            listener();
        }

        let err = self.closed_error();
        let seqs: Vec<i32> = self.waiters.iter().map(|e| *e.key()).collect();
        for seq in seqs {
            if let Some((_, waiter)) = self.waiters.remove(&seq) {
                let _ = waiter.send(Err(err.clone()));
            }
        }
        let seqs: Vec<i32> = self.flushers.iter().map(|e| *e.key()).collect();
        for seq in seqs {
            if let Some((_, flusher)) = self.flushers.remove(&seq) {
                let _ = flusher.send(Err(err.clone()));
            }
        }

        let receivers: Vec<Arc<dyn MessageReceiver>> =
            lock(&self.receivers).drain().map(|(_, r)| r).collect();
        for receiver in receivers {
            receiver.closed(&err);
        }
    }

    /// Run `f` once when the channel closes. Runs immediately if it already
    /// has.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        let mut listeners = lock(&self.close_listeners);
        if self.closed.load(Ordering::Acquire) {
            drop(listeners);
            f();
        } else {
            listeners.push(Box::new(f));
        }
    }

    /// The error pending operations fail with once closed.
    fn closed_error(&self) -> ZitiError {
        match self.close_cause.get() {
            Some(cause @ ZitiError::ChannelClosed(_)) => cause.clone(),
            Some(cause) => ZitiError::ChannelClosed(cause.to_string().into()),
            None => ZitiError::channel_closed("closed"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Process-unique channel id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Router address this channel was dialed to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Outbound frame rate (frames per second, one-minute average).
    #[must_use]
    pub fn up_rate(&self) -> f64 {
        self.up.rate()
    }

    /// Inbound frame rate (frames per second, one-minute average).
    #[must_use]
    pub fn down_rate(&self) -> f64 {
        self.down.rate()
    }

    /// Outbound meter.
    #[must_use]
    pub fn up_meter(&self) -> &RateMeter {
        &self.up
    }

    /// Inbound meter.
    #[must_use]
    pub fn down_meter(&self) -> &RateMeter {
        &self.down
    }

    /// Session keys for virtual connection `conn_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidState`] if the hello exchange has not
    /// completed on this channel.
    pub fn session_pair(&self, conn_id: u32) -> Result<SessionPair> {
        self.keys
            .get()
            .map(|keys| keys.session_pair(conn_id))
            .ok_or(ZitiError::invalid_state("channel has no key agreement"))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receivers
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a receiver under a fresh connection id.
    pub fn register_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> u32 {
        let mut receivers = lock(&self.receivers);
        let conn_id = self.receiver_seq.fetch_add(1, Ordering::Relaxed);
        receivers.insert(conn_id, receiver);
        conn_id
    }

    /// Remove the receiver for `conn_id`, if any.
    pub fn deregister_receiver(&self, conn_id: u32) {
        lock(&self.receivers).remove(&conn_id);
    }

    /// Number of registered receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        lock(&self.receivers).len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Assign a sequence number and queue `msg`. `register` runs with the
    /// assigned sequence number before the frame can reach the sender.
    async fn enqueue(&self, mut msg: Message, register: impl FnOnce(i32)) -> Result<i32> {
        let _guard = self.enqueue_lock.lock().await;
        let tx = lock(&self.sender)
            .clone()
            .ok_or_else(|| self.closed_error())?;

        let seq = self.sequencer.fetch_add(1, Ordering::Relaxed);
        msg.seq = seq;
        register(seq);

        if tx.send(msg).await.is_err() {
            self.waiters.remove(&seq);
            self.flushers.remove(&seq);
            return Err(self.closed_error());
        }
        Ok(seq)
    }

    /// Queue `msg`; returns its sequence number once queued.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ChannelClosed`] if the channel is closed.
    pub async fn send(&self, msg: Message) -> Result<i32> {
        self.enqueue(msg, |_| {}).await
    }

    /// Queue `msg` without waiting, for callers outside an async context.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidState`] if the send queue is full or busy,
    /// and [`ZitiError::ChannelClosed`] if the channel is closed.
    pub fn try_send(&self, mut msg: Message) -> Result<i32> {
        let Ok(_guard) = self.enqueue_lock.try_lock() else {
            return Err(ZitiError::invalid_state("channel send queue busy"));
        };
        let tx = lock(&self.sender)
            .clone()
            .ok_or_else(|| self.closed_error())?;

        let seq = self.sequencer.fetch_add(1, Ordering::Relaxed);
        msg.seq = seq;
        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ZitiError::invalid_state("channel send queue full")
            }
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })?;
        Ok(seq)
    }

    /// Queue `msg` and wait until it has been written to the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport write error, or [`ZitiError::ChannelClosed`].
    pub async fn send_and_flush(&self, msg: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(msg, |seq| {
            self.flushers.insert(seq, tx);
        })
        .await?;
        rx.await.unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Queue `msg` and wait for the frame that replies to it.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ChannelClosed`] if the channel closes first.
    pub async fn send_and_wait(&self, msg: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(msg, |seq| {
            self.waiters.insert(seq, tx);
        })
        .await?;
        rx.await.unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// [`send_and_wait`](Self::send_and_wait) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::Timeout`] if no reply arrives in time.
    pub async fn send_and_wait_timeout(&self, msg: Message, timeout: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let seq = self
            .enqueue(msg, |seq| {
                self.waiters.insert(seq, tx);
            })
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => reply.unwrap_or_else(|_| Err(self.closed_error())),
            Err(_) => {
                self.waiters.remove(&seq);
                Err(ZitiError::Timeout(
                    format!("no reply to frame {seq} on {}", self.addr).into(),
                ))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tasks
    // ═══════════════════════════════════════════════════════════════════════

    async fn run_sender(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Message>,
        mut writer: WriteHalf<BoxedTransport>,
    ) {
        while let Some(msg) = queue.recv().await {
            let seq = msg.seq;
            let flusher = self.flushers.remove(&seq).map(|(_, f)| f);
            tracing::trace!("ch[{}] > {} seq={}", self.id, msg.content_type, seq);

            let written = match msg.write_to(&mut writer).await {
                Ok(()) => writer.flush().await.map_err(ZitiError::from),
                Err(e) => Err(ZitiError::from(e)),
            };

            match written {
                Ok(()) => {
                    self.up.mark(1);
                    if let Some(flusher) = flusher {
                        let _ = flusher.send(Ok(()));
                    }
                }
                Err(e) => {
                    tracing::warn!("Channel {} write failed: {}", self.id, e);
                    if let Some(flusher) = flusher {
                        let _ = flusher.send(Err(e.clone()));
                    }
                    if let Some((_, waiter)) = self.waiters.remove(&seq) {
                        let _ = waiter.send(Err(e.clone()));
                    }
                    self.close_with(e);
                    return;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn run_receiver(self: Arc<Self>, mut reader: ReadHalf<BoxedTransport>) {
        loop {
            match Message::read_from(&mut reader).await {
                Ok(Some(msg)) => {
                    self.down.mark(1);
                    self.dispatch(msg).await;
                }
                Ok(None) => {
                    tracing::debug!("Channel {} closed by peer", self.id);
                    self.close_with(ZitiError::channel_closed("closed by peer"));
                    return;
                }
                Err(e) => {
                    let e = ZitiError::from(e);
                    tracing::warn!("Channel {} read failed: {}", self.id, e);
                    self.close_with(e);
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, msg: Message) {
        tracing::trace!(
            "ch[{}] < {} seq={} replyFor={:?}",
            self.id,
            msg.content_type,
            msg.seq,
            msg.reply_for()
        );

        if let Some(reply_for) = msg.reply_for() {
            if let Some((_, waiter)) = self.waiters.remove(&reply_for) {
                let _ = waiter.send(Ok(msg));
                return;
            }
        }

        if let Some(conn_id) = msg.conn_id() {
            let receiver = lock(&self.receivers).get(&conn_id).cloned();
            if let Some(receiver) = receiver {
                if let Err(e) = receiver.receive(msg).await {
                    tracing::warn!("Receiver for conn {} on channel {} failed: {}", conn_id, self.id, e);
                }
                return;
            }
        }

        tracing::warn!(
            "Channel {} dropping {} seq={} (no route)",
            self.id,
            msg.content_type,
            msg.seq
        );
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
