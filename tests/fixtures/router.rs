//! In-memory edge router and dialer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use ziti_core::protocol::{ContentType, header};
use ziti_core::Message;
use ziti_crypto::{KxKeyPair, KxRole, SecretStream, SharedKeys, Tag};
use ziti_transport::{BoxedTransport, Dialer, TransportError, TransportResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Edge router double.
///
/// Accepts hellos, answers CONNECT with `StateConnected`, and echoes every
/// decrypted payload back on the same virtual connection. Records every
/// frame it receives.
#[derive(Default)]
pub struct FakeEdgeRouter {
    frames: Mutex<Vec<Message>>,
    reject_connect: Mutex<Option<String>>,
    corrupt_conn: Mutex<Option<u32>>,
    silent: AtomicBool,
    /// Completed hellos
    pub hellos: AtomicUsize,
    links: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl FakeEdgeRouter {
    /// New router.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames received so far.
    pub fn frames(&self) -> Vec<Message> {
        lock(&self.frames).clone()
    }

    /// Received frames of one content type.
    pub fn frames_of(&self, content_type: ContentType) -> Vec<Message> {
        self.frames()
            .into_iter()
            .filter(|m| m.content_type == content_type)
            .collect()
    }

    /// Refuse further CONNECTs with `reason`.
    pub fn reject_connects(&self, reason: &str) {
        *lock(&self.reject_connect) = Some(reason.to_string());
    }

    /// Flip a ciphertext bit in echoes on `conn_id`.
    pub fn corrupt_echoes_on(&self, conn_id: u32) {
        *lock(&self.corrupt_conn) = Some(conn_id);
    }

    /// Stop answering hellos.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Drop every client link, as if the router restarted.
    pub fn drop_links(&self) {
        for link in lock(&self.links).drain(..) {
            link.abort();
        }
    }

    /// Serve one client link.
    pub fn serve(self: &Arc<Self>, stream: DuplexStream) {
        let link = tokio::spawn(self.clone().run(stream));
        lock(&self.links).push(link);
    }

    async fn run(self: Arc<Self>, stream: DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let kx = KxKeyPair::generate();
        let mut keys: Option<SharedKeys> = None;
        let mut streams: HashMap<u32, SecretStream> = HashMap::new();
        let mut seq = 0i32;

        while let Ok(Some(msg)) = Message::read_from(&mut reader).await {
            lock(&self.frames).push(msg.clone());

            match msg.content_type {
                ContentType::Hello => {
                    if self.silent.load(Ordering::SeqCst) {
                        continue;
                    }
                    let Some(client_pk) = msg.header(header::PUBLIC_KEY) else {
                        let reply = Message::result(msg.seq, false, "missing key");
                        let _ = send(&mut writer, &mut seq, reply).await;
                        continue;
                    };
                    keys = kx.agree(client_pk, KxRole::Router).ok();
                    let reply = Message::result(msg.seq, true, Vec::new())
                        .with_header(header::PUBLIC_KEY, kx.public_key().to_vec());
                    self.hellos.fetch_add(1, Ordering::SeqCst);
                    if send(&mut writer, &mut seq, reply).await.is_err() {
                        return;
                    }
                }
                ContentType::Connect => {
                    let (Some(conn_id), Some(keys)) = (msg.conn_id(), keys.as_ref()) else {
                        continue;
                    };
                    let rejection = lock(&self.reject_connect).clone();
                    let reply = if let Some(reason) = rejection {
                        let mut reply = Message::state_closed(conn_id, &reason);
                        reply.set_i32_header(header::REPLY_FOR, msg.seq);
                        reply
                    } else {
                        match accept(keys, conn_id, msg.header(header::PUBLIC_KEY)) {
                            Some((stream, local_header)) => {
                                streams.insert(conn_id, stream);
                                let mut reply = Message::new(ContentType::StateConnected)
                                    .with_header(header::PUBLIC_KEY, local_header.to_vec());
                                reply.set_u32_header(header::CONN_ID, conn_id);
                                reply.set_i32_header(header::REPLY_FOR, msg.seq);
                                reply
                            }
                            None => {
                                let mut reply = Message::state_closed(conn_id, "bad header");
                                reply.set_i32_header(header::REPLY_FOR, msg.seq);
                                reply
                            }
                        }
                    };
                    if send(&mut writer, &mut seq, reply).await.is_err() {
                        return;
                    }
                }
                ContentType::Data => {
                    let Some(conn_id) = msg.conn_id() else {
                        continue;
                    };
                    let Some(stream) = streams.get_mut(&conn_id) else {
                        continue;
                    };
                    let Ok((plaintext, tag)) = stream.decrypt_with_tag(&msg.body) else {
                        continue;
                    };
                    if tag == Tag::Final {
                        streams.remove(&conn_id);
                        continue;
                    }
                    if plaintext.is_empty() {
                        continue;
                    }
                    let mut frame = stream.encrypt(&plaintext);
                    if *lock(&self.corrupt_conn) == Some(conn_id) {
                        frame[0] ^= 0x01;
                    }
                    let echo = Message::data(conn_id, msg.i32_header(header::SEQ).unwrap_or(0), frame);
                    if send(&mut writer, &mut seq, echo).await.is_err() {
                        return;
                    }
                }
                ContentType::StateClosed => {
                    if let Some(conn_id) = msg.conn_id() {
                        streams.remove(&conn_id);
                    }
                }
                _ => {}
            }
        }
    }
}

fn accept(keys: &SharedKeys, conn_id: u32, peer_header: Option<&[u8]>) -> Option<(SecretStream, [u8; 24])> {
    let mut stream = SecretStream::new(&keys.session_pair(conn_id)).ok()?;
    let local_header = stream.header().ok()?;
    stream.init(peer_header?).ok()?;
    Some((stream, local_header))
}

async fn send(
    writer: &mut WriteHalf<DuplexStream>,
    seq: &mut i32,
    mut msg: Message,
) -> std::io::Result<()> {
    *seq += 1;
    msg.seq = *seq;
    writer.write_all(&msg.encode()).await?;
    writer.flush().await
}

/// Dialer that links every address to one [`FakeEdgeRouter`] in memory.
pub struct FakeDialer {
    router: Arc<FakeEdgeRouter>,
    refused: Mutex<HashSet<String>>,
    dials: Mutex<Vec<String>>,
}

impl FakeDialer {
    /// Dialer reaching `router` at every address.
    pub fn new(router: Arc<FakeEdgeRouter>) -> Arc<Self> {
        Arc::new(Self {
            router,
            refused: Mutex::new(HashSet::new()),
            dials: Mutex::new(Vec::new()),
        })
    }

    /// Refuse connections to `addr`.
    pub fn refuse(&self, addr: &str) {
        lock(&self.refused).insert(addr.to_string());
    }

    /// Addresses dialed so far, in order.
    pub fn dials(&self) -> Vec<String> {
        lock(&self.dials).clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, addr: &str) -> TransportResult<BoxedTransport> {
        lock(&self.dials).push(addr.to_string());
        if lock(&self.refused).contains(addr) {
            return Err(TransportError::ConnectionFailed(addr.to_string()));
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        self.router.serve(server);
        Ok(Box::new(client))
    }
}
