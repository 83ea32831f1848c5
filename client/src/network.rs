//! Client-side connection handling: handshake, broadcast decoding, and
//! message sending.

use log::warn;
use shared::{
    parse_broadcast, read_frame_limited, write_frame, FrameRead, FrameType, BROADCAST_OVERHEAD,
    MAX_PAYLOAD_LEN,
};
use std::io;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Broadcasts wrap the message text in a structured payload, so a maximal
/// message comes back slightly larger than the server-side frame ceiling.
const RECV_LIMIT: u32 = MAX_PAYLOAD_LEN + BROADCAST_OVERHEAD;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("server rejected us: {0}")]
    Rejected(String),
    #[error("server closed the connection during handshake")]
    Disconnected,
    #[error("server sent an oversized frame")]
    OversizedFrame,
}

/// A connected, handshaken chat client.
pub struct ChatClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// Receive half after [`ChatClient::split`].
pub struct BroadcastReader {
    reader: OwnedReadHalf,
}

/// Send half after [`ChatClient::split`].
pub struct MessageSender {
    writer: OwnedWriteHalf,
}

impl ChatClient {
    /// Connects and runs the handshake: send `HELLO(username)`, expect
    /// `OK`. History frames follow on the read side and come out of
    /// [`BroadcastReader::next_broadcast`] like live messages.
    pub async fn connect(addr: &str, username: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, FrameType::Hello, username.as_bytes()).await?;

        match read_frame_limited(&mut reader, RECV_LIMIT).await? {
            FrameRead::Frame(frame) if frame.is(FrameType::Ok) => Ok(Self { reader, writer }),
            FrameRead::Frame(frame) if frame.is(FrameType::Err) => Err(ClientError::Rejected(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            FrameRead::Oversized(_) => Err(ClientError::OversizedFrame),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Splits into independently usable receive and send halves.
    pub fn split(self) -> (BroadcastReader, MessageSender) {
        (
            BroadcastReader {
                reader: self.reader,
            },
            MessageSender {
                writer: self.writer,
            },
        )
    }
}

impl BroadcastReader {
    /// Waits for the next broadcast, skipping frames of any other type.
    /// `Ok(None)` means the server closed the connection; an `ERR` frame
    /// surfaces as [`ClientError::Rejected`].
    pub async fn next_broadcast(&mut self) -> Result<Option<(u64, String, String)>, ClientError> {
        loop {
            match read_frame_limited(&mut self.reader, RECV_LIMIT).await? {
                FrameRead::Frame(frame) if frame.is(FrameType::Broadcast) => {
                    match parse_broadcast(&frame.payload) {
                        Some(broadcast) => return Ok(Some(broadcast)),
                        None => warn!("ignoring malformed broadcast payload"),
                    }
                }
                FrameRead::Frame(frame) if frame.is(FrameType::Err) => {
                    return Err(ClientError::Rejected(
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    ));
                }
                FrameRead::Frame(_) => {}
                FrameRead::Closed => return Ok(None),
                FrameRead::Oversized(_) => return Err(ClientError::OversizedFrame),
            }
        }
    }
}

impl MessageSender {
    pub async fn send_message(&mut self, text: &str) -> Result<(), ClientError> {
        write_frame(&mut self.writer, FrameType::Msg, text.as_bytes()).await?;
        Ok(())
    }
}
