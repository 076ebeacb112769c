//! TCP request/reply client for the notification channel
//!
//! Connects to the consumer endpoint once at startup and then speaks the
//! strictly alternating send/receive pattern: one framed request, one framed
//! reply, reply discarded.

use std::io::BufReader;
use std::net::TcpStream;

use tracing::debug;

use crate::core::ConnectionEvent;
use crate::error::{CapmetaError, Result, SinkError};

use super::{read_frame, write_frame, EventSink, WireMessage};

/// Synchronous request/reply sink over a TCP stream.
#[derive(Debug)]
pub struct TcpEventSink {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    endpoint: String,
}

impl TcpEventSink {
    /// Connect to an endpoint of the form `tcp://host:port`.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let addr = endpoint
            .strip_prefix("tcp://")
            .ok_or_else(|| CapmetaError::InvalidEndpoint(endpoint.to_string()))?;

        let stream = TcpStream::connect(addr).map_err(CapmetaError::Io)?;
        stream.set_nodelay(true).map_err(CapmetaError::Io)?;
        let reader = BufReader::new(stream.try_clone().map_err(CapmetaError::Io)?);

        debug!("Connected to notification sink at {}", endpoint);

        Ok(Self {
            stream,
            reader,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one message and wait for the peer's reply.
    fn request(&mut self, msg: &WireMessage) -> std::result::Result<(), SinkError> {
        write_frame(&mut self.stream, msg)?;
        let _reply = read_frame(&mut self.reader)?;
        Ok(())
    }
}

impl EventSink for TcpEventSink {
    fn report_open(&mut self, event: &ConnectionEvent) -> std::result::Result<(), SinkError> {
        self.request(&WireMessage::OpenNotify(event.clone()))
    }

    fn report_close(&mut self, event: &ConnectionEvent) -> std::result::Result<(), SinkError> {
        self.request(&WireMessage::CloseNotify(event.clone()))
    }

    fn flush(&mut self) -> std::result::Result<(), SinkError> {
        self.request(&WireMessage::Sync)
    }
}
