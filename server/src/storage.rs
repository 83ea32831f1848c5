//! Durable message store: a bounded in-memory ring of recent messages plus
//! an append-only log file, with optional sealed-envelope encryption of the
//! text column.
//!
//! One lock guards both the ring and the log handle so the in-memory view
//! and the on-disk tail cannot diverge under concurrent senders. Log
//! records are tab-separated lines:
//!
//! ```text
//! ts_ms \t escaped(user) \t payload \t tag_hex
//! ```
//!
//! where `payload` is escaped plaintext, `BLOB:<hex>` (current encrypted
//! form), or `GCM:...` (legacy static-key records, skipped on replay).

use crate::crypto;
use log::{debug, info, warn};
use shared::{escape_tsv, unescape_tsv, Message};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

pub const MESSAGES_FILE: &str = "messages.log";
pub const USERS_FILE: &str = "users.log";

const BLOB_PREFIX: &str = "BLOB:";
const LEGACY_PREFIX: &str = "GCM:";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot create data directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open {path} for append: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {path}: {source}")]
    ReadLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct StoreInner {
    ring: VecDeque<Message>,
    log: File,
    enc_key: Option<Vec<u8>>,
}

impl StoreInner {
    fn push(&mut self, message: Message, cap: usize) {
        if self.ring.len() >= cap {
            self.ring.pop_front();
        }
        self.ring.push_back(message);
    }

    /// Renders one log record, sealing the text when encryption is on.
    /// A sealing failure degrades to the escaped-plaintext form so the
    /// message is never lost.
    fn render_record(&self, m: &Message) -> String {
        if let Some(key) = &self.enc_key {
            match crypto::seal(key, m.text.as_bytes()) {
                Ok(blob) => {
                    return format!(
                        "{}\t{}\t{}{}\t{}\n",
                        m.ts_ms,
                        escape_tsv(&m.user),
                        BLOB_PREFIX,
                        hex::encode(blob),
                        m.tag_hex
                    );
                }
                Err(e) => {
                    warn!("sealing failed ({}), writing plaintext record", e);
                }
            }
        }
        format!(
            "{}\t{}\t{}\t{}\n",
            m.ts_ms,
            escape_tsv(&m.user),
            escape_tsv(&m.text),
            m.tag_hex
        )
    }
}

/// Shared message store. Cheap to share behind an `Arc`; every method
/// takes `&self`.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
    log_path: PathBuf,
    cap: usize,
}

impl MessageStore {
    /// Ensures `data_dir` exists and opens the message log in append
    /// mode. Either failure is fatal to startup.
    pub async fn open(data_dir: &Path, cap: usize) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: data_dir.to_path_buf(),
                source,
            })?;

        let log_path = data_dir.join(MESSAGES_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|source| StorageError::OpenLog {
                path: log_path.clone(),
                source,
            })?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                ring: VecDeque::with_capacity(cap),
                log,
                enc_key: None,
            }),
            log_path,
            cap,
        })
    }

    /// Switches subsequent appends into sealed-envelope mode. Idempotent.
    pub async fn enable_encryption(&self, key: Vec<u8>) {
        self.inner.lock().await.enc_key = Some(key);
    }

    /// Inserts into the ring (evicting the oldest entry at capacity) and
    /// appends one flushed log record, both under one critical section.
    /// A failed log write is logged and swallowed: live delivery wins
    /// over durability.
    pub async fn append(&self, message: Message) {
        let mut inner = self.inner.lock().await;
        let record = inner.render_record(&message);
        inner.push(message, self.cap);

        let write = async {
            inner.log.write_all(record.as_bytes()).await?;
            inner.log.flush().await
        };
        if let Err(e) = write.await {
            warn!("failed to append to {}: {}", self.log_path.display(), e);
        }
    }

    /// Replays the log tail into the ring. Only the last `max_lines`
    /// records are retained while reading (sliding window), so memory
    /// stays bounded no matter how large the log has grown. Unparsable,
    /// legacy-encrypted, and undecryptable records are skipped, never
    /// fatal. Usernames of accepted records are collected into
    /// `users_out`. Returns the number of messages loaded.
    pub async fn load_from_log(
        &self,
        max_lines: usize,
        users_out: &mut HashSet<String>,
    ) -> Result<usize, StorageError> {
        let file = File::open(&self.log_path)
            .await
            .map_err(|source| StorageError::ReadLog {
                path: self.log_path.clone(),
                source,
            })?;

        let mut window: VecDeque<String> = VecDeque::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|source| StorageError::ReadLog {
                path: self.log_path.clone(),
                source,
            })?
        {
            if window.len() >= max_lines {
                window.pop_front();
            }
            window.push_back(line);
        }

        let mut inner = self.inner.lock().await;
        let mut loaded = 0usize;
        for line in window {
            let Some(message) = parse_record(&line, inner.enc_key.as_deref()) else {
                debug!("skipping unreadable log record");
                continue;
            };
            users_out.insert(message.user.clone());
            inner.push(message, self.cap);
            loaded += 1;
        }

        info!(
            "replayed {} message(s) from {}",
            loaded,
            self.log_path.display()
        );
        Ok(loaded)
    }

    /// The `n` most recent messages in chronological order, as an
    /// independent copy. Asking for more than is buffered returns
    /// everything available.
    pub async fn last(&self, n: usize) -> Vec<Message> {
        let inner = self.inner.lock().await;
        let skip = inner.ring.len().saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.ring.len()
    }
}

/// Parses one TSV record. Returns `None` for anything that should be
/// skipped: too few columns, a bad timestamp, legacy `GCM:` payloads, and
/// `BLOB:` payloads that are undecodable, undecryptable, or present while
/// encryption is off.
fn parse_record(line: &str, enc_key: Option<&[u8]>) -> Option<Message> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < 4 {
        return None;
    }

    let ts_ms: u64 = cols[0].parse().ok()?;
    let user = unescape_tsv(cols[1]);
    let payload = cols[2];

    let text = if payload.starts_with(LEGACY_PREFIX) {
        // Old static-key records: recognized, never decrypted.
        return None;
    } else if let Some(blob_hex) = payload.strip_prefix(BLOB_PREFIX) {
        let key = enc_key?;
        let blob = hex::decode(blob_hex).ok()?;
        let plain = crypto::open(key, &blob).ok()?;
        String::from_utf8_lossy(&plain).into_owned()
    } else {
        unescape_tsv(payload)
    };

    Some(Message {
        ts_ms,
        user,
        text,
        tag_hex: cols[3].to_string(),
    })
}

struct UserBookInner {
    names: HashSet<String>,
    log: File,
}

/// Known usernames with a write-through `users.log`. Seeded from log
/// replay at startup; the handshake path records each name it sees.
pub struct UserBook {
    inner: Mutex<UserBookInner>,
}

impl UserBook {
    /// Opens `users.log` in append mode. `seed` names (from replay) are
    /// considered already recorded and are not re-written.
    pub async fn open(data_dir: &Path, seed: HashSet<String>) -> Result<Self, StorageError> {
        let path = data_dir.join(USERS_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StorageError::OpenLog {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            inner: Mutex::new(UserBookInner { names: seed, log }),
        })
    }

    /// Check-and-insert under one lock. First sight of a name appends a
    /// flushed line; a failed write is logged and swallowed. Returns
    /// whether the name was new.
    pub async fn record(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.names.insert(name.to_string()) {
            return false;
        }

        let line = format!("{}\n", name);
        let write = async {
            inner.log.write_all(line.as_bytes()).await?;
            inner.log.flush().await
        };
        if let Err(e) = write.await {
            warn!("failed to append to users log: {}", e);
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::integrity_tag;
    use tempfile::tempdir;

    fn msg(ts_ms: u64, user: &str, text: &str) -> Message {
        Message {
            ts_ms,
            user: user.to_string(),
            text: text.to_string(),
            tag_hex: integrity_tag(ts_ms, user, text, "test-secret"),
        }
    }

    #[tokio::test]
    async fn ring_evicts_oldest_at_capacity() {
        let dir = tempdir().unwrap();
        let store = MessageStore::open(dir.path(), 4).await.unwrap();

        for i in 0..7u64 {
            store.append(msg(i, "alice", &format!("m{}", i))).await;
        }

        let last = store.last(4).await;
        assert_eq!(last.len(), 4);
        let texts: Vec<&str> = last.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m4", "m5", "m6"]);
    }

    #[tokio::test]
    async fn last_over_ask_returns_everything() {
        let dir = tempdir().unwrap();
        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        store.append(msg(1, "a", "one")).await;
        store.append(msg(2, "b", "two")).await;

        let all = store.last(100).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "one");
        assert_eq!(all[1].text, "two");

        assert!(store.last(0).await.is_empty());
    }

    #[tokio::test]
    async fn append_writes_one_tsv_record_per_message() {
        let dir = tempdir().unwrap();
        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        let m = msg(123, "alice", "hello");
        store.append(m.clone()).await;

        let content = std::fs::read_to_string(dir.path().join(MESSAGES_FILE)).unwrap();
        assert_eq!(content, format!("123\talice\thello\t{}\n", m.tag_hex));
    }

    #[tokio::test]
    async fn separators_in_fields_are_escaped_and_replayed() {
        let dir = tempdir().unwrap();
        {
            let store = MessageStore::open(dir.path(), 10).await.unwrap();
            store.append(msg(1, "tab\tuser", "line\none\\two")).await;
        }

        let content = std::fs::read_to_string(dir.path().join(MESSAGES_FILE)).unwrap();
        assert_eq!(content.lines().count(), 1);

        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(100, &mut users).await.unwrap(), 1);
        let replayed = store.last(1).await;
        assert_eq!(replayed[0].user, "tab\tuser");
        assert_eq!(replayed[0].text, "line\none\\two");
        assert!(users.contains("tab\tuser"));
    }

    #[tokio::test]
    async fn encrypted_append_roundtrips_through_replay() {
        let dir = tempdir().unwrap();
        let key = vec![7u8; 32];
        {
            let store = MessageStore::open(dir.path(), 10).await.unwrap();
            store.enable_encryption(key.clone()).await;
            store.append(msg(5, "alice", "secret text")).await;
        }

        let content = std::fs::read_to_string(dir.path().join(MESSAGES_FILE)).unwrap();
        assert!(content.contains("\tBLOB:"));
        assert!(!content.contains("secret text"));

        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        store.enable_encryption(key).await;
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(100, &mut users).await.unwrap(), 1);
        assert_eq!(store.last(1).await[0].text, "secret text");
    }

    #[tokio::test]
    async fn sealed_records_are_skipped_without_a_key() {
        let dir = tempdir().unwrap();
        {
            let store = MessageStore::open(dir.path(), 10).await.unwrap();
            store.enable_encryption(vec![7u8; 32]).await;
            store.append(msg(5, "alice", "secret text")).await;
        }

        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(100, &mut users).await.unwrap(), 0);
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_among_valid_ones_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MESSAGES_FILE);
        let good1 = msg(1, "a", "first");
        let good2 = msg(3, "b", "third");
        std::fs::write(
            &path,
            format!(
                "1\ta\tfirst\t{}\n2\tb\tBLOB:zznothex\tdeadbeef\n3\tb\tthird\t{}\n",
                good1.tag_hex, good2.tag_hex
            ),
        )
        .unwrap();

        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        store.enable_encryption(vec![1u8; 32]).await;
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(100, &mut users).await.unwrap(), 2);

        let texts: Vec<String> = store.last(10).await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "third"]);
    }

    #[tokio::test]
    async fn legacy_gcm_records_are_always_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MESSAGES_FILE);
        std::fs::write(
            &path,
            "1\told\tGCM:0011:2233:4455\tcafe\n2\tnew\tplain\tbabe\n",
        )
        .unwrap();

        let store = MessageStore::open(dir.path(), 10).await.unwrap();
        store.enable_encryption(vec![1u8; 32]).await;
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(100, &mut users).await.unwrap(), 1);
        assert_eq!(store.last(10).await[0].user, "new");
        assert!(!users.contains("old"));
    }

    #[tokio::test]
    async fn replay_window_keeps_only_the_tail() {
        let dir = tempdir().unwrap();
        {
            let store = MessageStore::open(dir.path(), 100).await.unwrap();
            for i in 0..10u64 {
                store.append(msg(i, "u", &format!("m{}", i))).await;
            }
        }

        let store = MessageStore::open(dir.path(), 100).await.unwrap();
        let mut users = HashSet::new();
        assert_eq!(store.load_from_log(3, &mut users).await.unwrap(), 3);
        let texts: Vec<String> = store.last(10).await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["m7", "m8", "m9"]);
    }

    #[test]
    fn parse_record_rejects_malformed_lines() {
        assert!(parse_record("", None).is_none());
        assert!(parse_record("1\talice\tonly-three", None).is_none());
        assert!(parse_record("not-a-ts\talice\thi\ttag", None).is_none());
        assert!(parse_record("1\talice\tBLOB:00ff\ttag", None).is_none());

        let ok = parse_record("1\talice\thi\ttag", None).unwrap();
        assert_eq!(ok.ts_ms, 1);
        assert_eq!(ok.user, "alice");
        assert_eq!(ok.text, "hi");
        assert_eq!(ok.tag_hex, "tag");
    }

    #[test]
    fn parse_record_ignores_extra_columns() {
        let m = parse_record("1\ta\thello\ttag\textra", None).unwrap();
        assert_eq!(m.text, "hello");
        assert_eq!(m.tag_hex, "tag");
    }

    #[tokio::test]
    async fn user_book_records_each_name_once() {
        let dir = tempdir().unwrap();
        let mut seed = HashSet::new();
        seed.insert("seeded".to_string());
        let book = UserBook::open(dir.path(), seed).await.unwrap();

        assert!(!book.record("seeded").await);
        assert!(book.record("alice").await);
        assert!(!book.record("alice").await);
        assert!(book.record("bob").await);
        assert_eq!(book.len().await, 3);

        let content = std::fs::read_to_string(dir.path().join(USERS_FILE)).unwrap();
        assert_eq!(content, "alice\nbob\n");
    }
}
