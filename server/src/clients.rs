//! Live-client registry and per-connection send path.
//!
//! Connections register here as soon as they are accepted, before the
//! handshake finishes, and are removed on teardown. Broadcast holds the
//! registry lock for the whole fan-out pass so the set cannot change
//! mid-broadcast; a client whose send fails is marked dead and dropped
//! from the set within that same pass without disturbing the others.

use log::{debug, info};
use shared::{write_frame, FrameType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// One connected client: the socket write half behind its own lock, a
/// set-once username, and an `alive` flag flipped on the first failed
/// send or at teardown.
pub struct ClientConn {
    id: u64,
    peer: SocketAddr,
    username: OnceLock<String>,
    alive: AtomicBool,
    writer: Mutex<OwnedWriteHalf>,
}

impl ClientConn {
    fn new(id: u64, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            peer,
            username: OnceLock::new(),
            alive: AtomicBool::new(true),
            writer: Mutex::new(writer),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Username recorded by the handshake; `None` until then.
    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Records the handshake username. Only the first call takes effect.
    pub fn set_username(&self, name: String) {
        let _ = self.username.set(name);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Sends one frame. Any I/O failure marks the connection dead and
    /// returns `false`; nothing is reported to the peer.
    pub async fn send(&self, frame_type: FrameType, payload: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, frame_type, payload).await {
            Ok(()) => true,
            Err(e) => {
                debug!("send to client {} failed: {}", self.id, e);
                self.mark_dead();
                false
            }
        }
    }
}

/// The shared set of live connections.
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientConn>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a freshly accepted connection and returns its handle.
    pub async fn register(&self, peer: SocketAddr, writer: OwnedWriteHalf) -> Arc<ClientConn> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(ClientConn::new(id, peer, writer));
        self.clients.lock().await.push(Arc::clone(&conn));
        info!("client {} connected from {}", id, peer);
        conn
    }

    /// Removes a connection from the live set, if still present.
    pub async fn remove(&self, id: u64) {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|c| c.id != id);
        if clients.len() != before {
            info!("client {} disconnected", id);
        }
    }

    /// Sends one frame to every live client. Failed or already-dead
    /// clients are evicted in place; delivery to the rest continues. The
    /// registry lock is held for the entire pass.
    pub async fn broadcast(&self, frame_type: FrameType, payload: &[u8]) {
        let mut clients = self.clients.lock().await;
        let mut i = 0;
        while i < clients.len() {
            let conn = Arc::clone(&clients[i]);
            if conn.is_alive() && conn.send(frame_type, payload).await {
                i += 1;
            } else {
                info!("dropping client {} during broadcast", conn.id);
                clients.remove(i);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{read_frame, FrameRead};
    use tokio::net::{TcpListener, TcpStream};

    /// Accepted/connected socket pair over loopback.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, client)
    }

    #[tokio::test]
    async fn register_and_remove() {
        let registry = ClientRegistry::new();
        let (server_side, _client_side) = socket_pair().await;
        let peer = server_side.peer_addr().unwrap();
        let (_, writer) = server_side.into_split();

        let conn = registry.register(peer, writer).await;
        assert_eq!(registry.len().await, 1);
        assert!(conn.is_alive());
        assert!(conn.username().is_none());

        registry.remove(conn.id()).await;
        assert_eq!(registry.len().await, 0);
        // A second remove is a no-op.
        registry.remove(conn.id()).await;
    }

    #[tokio::test]
    async fn username_is_set_once() {
        let (server_side, _client_side) = socket_pair().await;
        let peer = server_side.peer_addr().unwrap();
        let (_, writer) = server_side.into_split();
        let conn = ClientConn::new(1, peer, writer);

        conn.set_username("alice".to_string());
        conn.set_username("mallory".to_string());
        assert_eq!(conn.username(), Some("alice"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_live_client() {
        let registry = ClientRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (server_side, client_side) = socket_pair().await;
            let peer = server_side.peer_addr().unwrap();
            let (_, writer) = server_side.into_split();
            registry.register(peer, writer).await;
            receivers.push(client_side);
        }

        registry.broadcast(FrameType::Broadcast, b"payload").await;
        assert_eq!(registry.len().await, 3);

        for mut receiver in receivers {
            match read_frame(&mut receiver).await.unwrap() {
                FrameRead::Frame(frame) => {
                    assert!(frame.is(FrameType::Broadcast));
                    assert_eq!(frame.payload, b"payload");
                }
                other => panic!("expected frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn dead_client_is_evicted_mid_broadcast() {
        let registry = ClientRegistry::new();

        let (server_a, client_a) = socket_pair().await;
        let peer_a = server_a.peer_addr().unwrap();
        let (_, writer_a) = server_a.into_split();
        let conn_a = registry.register(peer_a, writer_a).await;

        let (server_b, mut client_b) = socket_pair().await;
        let peer_b = server_b.peer_addr().unwrap();
        let (_, writer_b) = server_b.into_split();
        registry.register(peer_b, writer_b).await;

        // Simulate a failed earlier send to A.
        conn_a.mark_dead();
        drop(client_a);

        registry.broadcast(FrameType::Broadcast, b"still here").await;
        assert_eq!(registry.len().await, 1);

        match read_frame(&mut client_b).await.unwrap() {
            FrameRead::Frame(frame) => assert_eq!(frame.payload, b"still here"),
            other => panic!("expected frame, got {:?}", other),
        }
    }
}
