//! Accept loop, per-connection handshake and read loop, and the broadcast
//! path tying the store and the client registry together.
//!
//! One tokio task serves each accepted connection; frame-boundary reads
//! are its only suspension points, so a slow or silent peer stalls
//! nothing but its own task. Connection lifecycle:
//! accepted -> handshaking -> active -> closed, with `closed` reachable
//! from anywhere on I/O failure or protocol violation.

use crate::clients::{ClientConn, ClientRegistry};
use crate::config::Config;
use crate::crypto;
use crate::storage::{MessageStore, StorageError, UserBook};
use log::{debug, info, warn};
use shared::{
    make_broadcast, now_ms, read_frame, FrameRead, FrameType, Message, MAX_HELLO_LEN,
};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

/// Capacity of the recent-messages ring.
pub const RING_CAPACITY: usize = 200;

/// How many log lines are replayed into the ring at startup.
pub const REPLAY_WINDOW: usize = 2000;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid encryption key material (need 64 hex chars)")]
    InvalidKeyMaterial,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The chat server: listener plus the shared state every connection task
/// gets a handle to.
pub struct ChatServer {
    listener: TcpListener,
    store: Arc<MessageStore>,
    clients: Arc<ClientRegistry>,
    users: Arc<UserBook>,
    secret: Arc<str>,
    history_on_join: usize,
}

impl ChatServer {
    /// Opens the store, replays the log, and binds the listener. Any
    /// failure here is a fatal configuration problem: the server must not
    /// come up half-working.
    pub async fn bind(cfg: Config) -> Result<Self, ServerError> {
        let store = Arc::new(MessageStore::open(&cfg.data_dir, RING_CAPACITY).await?);

        if cfg.enc_enabled {
            let key = hex::decode(&cfg.enc_key_hex)
                .ok()
                .filter(|k| k.len() == crypto::KEY_LEN)
                .ok_or(ServerError::InvalidKeyMaterial)?;
            store.enable_encryption(key).await;
        }

        let mut known_users = HashSet::new();
        store.load_from_log(REPLAY_WINDOW, &mut known_users).await?;
        let users = Arc::new(UserBook::open(&cfg.data_dir, known_users).await?);

        let addr = format!("{}:{}", cfg.bind_addr, cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        info!(
            "listening on {} | data={} | log-encryption={}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or(addr),
            cfg.data_dir.display(),
            if cfg.enc_enabled { "aes-256-gcm" } else { "off" }
        );

        Ok(Self {
            listener,
            store,
            clients: Arc::new(ClientRegistry::new()),
            users,
            secret: cfg.secret.into(),
            history_on_join: cfg.history_on_join,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the future is dropped (which closes the
    /// listener; connected handlers then exit on their next failed read).
    /// Each accepted connection is registered in the live set before its
    /// handler task starts.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    let (reader, writer) = socket.into_split();
                    let conn = self.clients.register(peer, writer).await;

                    let store = Arc::clone(&self.store);
                    let clients = Arc::clone(&self.clients);
                    let users = Arc::clone(&self.users);
                    let secret = Arc::clone(&self.secret);
                    let history_on_join = self.history_on_join;
                    tokio::spawn(async move {
                        handle_connection(
                            store,
                            clients,
                            users,
                            secret,
                            history_on_join,
                            conn,
                            reader,
                        )
                        .await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Full connection lifecycle; teardown runs no matter where the
/// handshake or read loop bailed out.
async fn handle_connection(
    store: Arc<MessageStore>,
    clients: Arc<ClientRegistry>,
    users: Arc<UserBook>,
    secret: Arc<str>,
    history_on_join: usize,
    conn: Arc<ClientConn>,
    mut reader: OwnedReadHalf,
) {
    if let Some(username) = handshake(&store, &users, history_on_join, &conn, &mut reader).await {
        read_loop(&store, &clients, &secret, &username, &conn, &mut reader).await;
    }

    conn.mark_dead();
    clients.remove(conn.id()).await;
}

/// Runs the handshake: exactly one HELLO, username validation, then `OK`
/// and the recent history. Protocol violations answer one ERR frame and
/// give up; transport failures just give up.
async fn handshake(
    store: &MessageStore,
    users: &UserBook,
    history_on_join: usize,
    conn: &Arc<ClientConn>,
    reader: &mut OwnedReadHalf,
) -> Option<String> {
    let frame = match read_frame(reader).await {
        Ok(FrameRead::Frame(frame)) => frame,
        Ok(FrameRead::Oversized(_)) => {
            conn.send(FrameType::Err, b"Payload too big").await;
            return None;
        }
        Ok(FrameRead::Closed) | Err(_) => return None,
    };

    if !frame.is(FrameType::Hello) {
        conn.send(FrameType::Err, b"Expected HELLO").await;
        return None;
    }
    if frame.payload.is_empty() || frame.payload.len() > MAX_HELLO_LEN {
        conn.send(FrameType::Err, b"Bad HELLO").await;
        return None;
    }

    let mut username = String::from_utf8_lossy(&frame.payload).into_owned();
    username.retain(|c| c != '\r' && c != '\n');
    if username.is_empty() {
        conn.send(FrameType::Err, b"Empty username").await;
        return None;
    }

    // No uniqueness enforcement: two connections may share a name.
    conn.set_username(username.clone());
    users.record(&username).await;

    if !conn.send(FrameType::Ok, &[]).await {
        return None;
    }
    for m in store.last(history_on_join).await {
        let payload = make_broadcast(m.ts_ms, &m.user, &m.text);
        if !conn.send(FrameType::Broadcast, &payload).await {
            return None;
        }
    }

    info!("client {} joined as {:?}", conn.id(), username);
    Some(username)
}

/// Active phase: decode frames until the connection dies. Only MSG frames
/// do anything; every other type, recognized or not, is ignored so newer
/// clients keep working against this server.
async fn read_loop(
    store: &MessageStore,
    clients: &ClientRegistry,
    secret: &str,
    username: &str,
    conn: &Arc<ClientConn>,
    reader: &mut OwnedReadHalf,
) {
    loop {
        match read_frame(reader).await {
            Ok(FrameRead::Frame(frame)) => {
                if frame.is(FrameType::Msg) {
                    let text = String::from_utf8_lossy(&frame.payload).into_owned();
                    relay_message(store, clients, secret, username, text).await;
                }
            }
            Ok(FrameRead::Oversized(len)) => {
                debug!("client {} declared a {} byte payload", conn.id(), len);
                conn.send(FrameType::Err, b"Payload too big").await;
                return;
            }
            Ok(FrameRead::Closed) => return,
            Err(e) => {
                debug!("read from client {} failed: {}", conn.id(), e);
                return;
            }
        }
    }
}

/// Stamps, stores, and fans out one message. The store append (ring +
/// flushed log line) happens before the fan-out, so the log reflects
/// exactly the messages that were offered to clients, in order.
async fn relay_message(
    store: &MessageStore,
    clients: &ClientRegistry,
    secret: &str,
    username: &str,
    text: String,
) {
    let message = Message::signed(now_ms(), username.to_string(), text, secret);
    let payload = make_broadcast(message.ts_ms, &message.user, &message.text);
    store.append(message).await;
    clients.broadcast(FrameType::Broadcast, &payload).await;
}
