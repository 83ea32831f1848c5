//! # Chat Server Library
//!
//! Server side of a LAN chat: clients connect over plain TCP, announce a
//! username, receive recent history, and from then on every message they
//! send is relayed to all connected clients and appended to a durable log.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! One tokio task per connection runs the handshake and read loop
//! independently, so a slow peer never stalls the accept loop or other
//! clients. The live-client set is shared behind a single lock that
//! broadcast holds for its whole fan-out pass.
//!
//! ### Message Persistence
//! A bounded ring of recent messages backs the join-time history, and an
//! append-only `messages.log` holds everything, replayed through a
//! sliding window at startup. Both sit behind one lock so memory and disk
//! cannot diverge under concurrent senders.
//!
//! ### At-Rest Encryption
//! With a configured key, message text is sealed with AES-256-GCM under a
//! key derived per record (PBKDF2-HMAC-SHA256, fresh random salt) before
//! hitting disk. Sealing failures degrade to plaintext rather than losing
//! the message; undecryptable records are skipped on replay, never fatal.
//!
//! ## Module Organization
//!
//! - [`config`]: `server.ini` handling, CLI overrides, first-run
//!   generation of the operator secret and encryption key
//! - [`crypto`]: key derivation, AES-256-GCM seal/open, the envelope
//!   format
//! - [`storage`]: the message store (ring + log) and the known-users book
//! - [`clients`]: live-client registry and the per-connection send path
//! - [`network`]: accept loop, handshake, read loop, broadcast
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Config;
//! use server::network::ChatServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ChatServer::bind(Config::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod clients;
pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
