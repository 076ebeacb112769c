//! Notification sink
//!
//! Delivers connection open/close events to the downstream consumer over a
//! synchronous request/reply channel. Every message is answered by the peer
//! before the next one is sent; the reply payload is discarded.
//!
//! Wire format: [4 bytes: length (big-endian)][JSON payload]

pub mod client;

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::core::ConnectionEvent;
use crate::error::SinkError;

pub use client::TcpEventSink;

/// Largest frame either side is allowed to produce.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Message envelope with type discrimination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireMessage {
    /// A connection was opened.
    OpenNotify(ConnectionEvent),
    /// A connection was closed.
    CloseNotify(ConnectionEvent),
    /// End-of-batch marker, carries no payload.
    Sync,
}

/// Destination for connection notifications.
///
/// Implementations block until the peer acknowledges each call; the trackers
/// treat a failure as report-and-continue.
pub trait EventSink {
    fn report_open(&mut self, event: &ConnectionEvent) -> Result<(), SinkError>;
    fn report_close(&mut self, event: &ConnectionEvent) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Write one length-prefixed message frame.
pub(crate) fn write_frame<W: Write>(writer: &mut W, msg: &WireMessage) -> Result<(), SinkError> {
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed reply frame, returning its raw payload.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, SinkError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SinkError::OversizeFrame { max: MAX_FRAME_LEN, got: len });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// In-memory sink that records everything it is handed.
///
/// Used by the test suites and by dry runs that want the event stream
/// without a live consumer.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub opens: Vec<ConnectionEvent>,
    pub closes: Vec<ConnectionEvent>,
    pub flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for MemorySink {
    fn report_open(&mut self, event: &ConnectionEvent) -> Result<(), SinkError> {
        self.opens.push(event.clone());
        Ok(())
    }

    fn report_close(&mut self, event: &ConnectionEvent) -> Result<(), SinkError> {
        self.closes.push(event.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }
}
