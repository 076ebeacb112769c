//! Connection metadata events
//!
//! The record pushed to the notification sink whenever a tracked flow opens
//! or closes. The fingerprint is the correlating identifier the consumer
//! uses to pair a close with its open, so it is always recomputed from the
//! open-time fields stored on the flow entry, never from the closing packet.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Metadata describing one tracked connection, as sent to the sink.
///
/// `protocol` and `l4_protocol` both carry the IP protocol number (1/6/17);
/// the consumer schema keeps them as separate columns. `end_timestamp_*` is
/// zero on open events and holds the close time on close events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    #[serde(with = "hex_fingerprint")]
    pub fingerprint: [u8; 16],
    #[serde(with = "dotted_quad")]
    pub src: u32,
    #[serde(with = "dotted_quad")]
    pub dst: u32,
    pub protocol: u16,
    pub l4_protocol: u16,
    pub l4_src: u16,
    pub l4_dst: u16,
    pub timestamp_s: u64,
    pub timestamp_us: u32,
    pub end_timestamp_s: u64,
    pub end_timestamp_us: u32,
    pub msgtype: i32,
    pub seqnum: i32,
}

impl ConnectionEvent {
    /// Compute the 16-byte connection fingerprint.
    ///
    /// The digest input XORs the address pair and the port pair so both
    /// directions of a flow hash identically, and mixes in the open
    /// timestamp so same-endpoint flows at different times stay distinct.
    /// All scalars are serialized little-endian.
    pub fn compute_fingerprint(&self) -> [u8; 16] {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&(self.src ^ self.dst).to_le_bytes());
        buf.extend_from_slice(&self.protocol.to_le_bytes());
        buf.extend_from_slice(&(self.l4_src ^ self.l4_dst).to_le_bytes());
        buf.extend_from_slice(&(self.msgtype as u32).to_le_bytes());
        buf.extend_from_slice(&(self.seqnum as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp_s.to_le_bytes());
        buf.extend_from_slice(&u64::from(self.timestamp_us).to_le_bytes());
        md5::compute(&buf).0
    }

    /// Recompute and store the fingerprint from the current field values.
    pub fn update_fingerprint(&mut self) {
        self.fingerprint = self.compute_fingerprint();
    }

    /// Fingerprint as the 32-char lowercase hex string used on the wire
    /// and in log lines.
    pub fn fingerprint_hex(&self) -> String {
        hex_fingerprint::encode(&self.fingerprint)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }
}

/// Serialize a 16-byte digest as a 32-char lowercase hex string.
mod hex_fingerprint {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(digest: &[u8; 16]) -> String {
        let mut s = String::with_capacity(32);
        for b in digest {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn serialize<S: Serializer>(digest: &[u8; 16], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(de)?;
        if s.len() != 32 {
            return Err(serde::de::Error::custom("fingerprint must be 32 hex chars"));
        }
        let mut digest = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(serde::de::Error::custom)?;
            digest[i] = u8::from_str_radix(pair, 16).map_err(serde::de::Error::custom)?;
        }
        Ok(digest)
    }
}

/// Serialize an IPv4 address held as a `u32` as its dotted-quad string.
mod dotted_quad {
    use std::net::Ipv4Addr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &u32, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&Ipv4Addr::from(*addr).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u32, D::Error> {
        let s = String::deserialize(de)?;
        let addr: Ipv4Addr = s.parse().map_err(serde::de::Error::custom)?;
        Ok(u32::from(addr))
    }
}
