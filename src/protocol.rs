//! Control message sent at the start of every TCP stream.
//!
//! A client announces the session it belongs to and its limits so the server
//! can group parallel streams and know when to stop waiting. The message is
//! framed as:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ Magic "RPF2" │ Length (u32) │   JSON Message body  │
//! └──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Everything after the message is measurement data. A stream that does not
//! start with the magic comes from a client that sends no control message; the
//! server then treats every byte as data.

use crate::config::TestLimit;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version for client-server communication.
pub const PROTOCOL_VERSION: u32 = 1;

/// Marker in front of the control message.
pub const CONTROL_MAGIC: [u8; 4] = *b"RPF2";

/// Upper bound on a control message body.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Message types in the rperf2 control protocol.
///
/// # Examples
///
/// ```
/// use rperf2::config::TestLimit;
/// use rperf2::protocol::Message;
/// use std::time::Duration;
///
/// let hello = Message::hello(7, 1, 4, TestLimit::Time(Duration::from_secs(10)));
/// assert!(matches!(hello, Message::Hello { parallel: 4, .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Stream announcement from the client
    Hello {
        version: u32,
        session_id: u64,
        stream_index: usize,
        parallel: usize,
        duration_ms: Option<u64>,
        byte_limit: Option<u64>,
    },
}

impl Message {
    /// Creates a Hello message for stream `stream_index` of `parallel`.
    pub fn hello(session_id: u64, stream_index: usize, parallel: usize, limit: TestLimit) -> Self {
        Message::Hello {
            version: PROTOCOL_VERSION,
            session_id,
            stream_index,
            parallel,
            duration_ms: limit.duration().map(|d| d.as_millis() as u64),
            byte_limit: limit.bytes(),
        }
    }
}

/// Serializes a protocol message to length-prefixed JSON bytes.
///
/// - First 4 bytes: message length as big-endian u32
/// - Remaining bytes: UTF-8 encoded JSON
///
/// # Examples
///
/// ```
/// use rperf2::config::TestLimit;
/// use rperf2::protocol::{Message, serialize_message};
///
/// let hello = Message::hello(1, 1, 1, TestLimit::Bytes(1_000));
/// let bytes = serialize_message(&hello).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Reads one length-prefixed JSON message from an async reader.
///
/// # Errors
///
/// Returns an error if reading fails, the declared length exceeds
/// [`MAX_MESSAGE_LEN`], or the body is not a valid message.
pub async fn deserialize_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "control message of {} bytes exceeds limit of {}",
            len, MAX_MESSAGE_LEN
        )));
    }

    let mut json_bytes = vec![0u8; len];
    reader.read_exact(&mut json_bytes).await?;

    let msg = serde_json::from_slice(&json_bytes)?;
    Ok(msg)
}

/// Writes the magic and a control message to the front of a stream.
pub async fn write_control<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let mut bytes = Vec::with_capacity(CONTROL_MAGIC.len() + 64);
    bytes.extend_from_slice(&CONTROL_MAGIC);
    bytes.extend_from_slice(&serialize_message(msg)?);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// What a server found at the front of a TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// The stream announced itself
    Control(Message),
    /// No control message; these bytes were already read and are data
    Data(Vec<u8>),
}

/// Reads the control message if the stream starts with one.
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Preamble> {
    let mut head = [0u8; CONTROL_MAGIC.len()];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            return Ok(Preamble::Data(head[..filled].to_vec()));
        }
        filled += n;
    }
    if head != CONTROL_MAGIC {
        return Ok(Preamble::Data(head.to_vec()));
    }
    Ok(Preamble::Control(deserialize_message(reader).await?))
}
