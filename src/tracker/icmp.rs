//! ICMP connection tracker
//!
//! Tracks request/reply style ICMP exchanges with the same idle-timeout
//! lifecycle as UDP. Flow identity is the symmetric IPv4 pair; the type and
//! sequence of the first observation ride along on the entry and are
//! reported on both the open and the close, so an echo reply joins the
//! entry its request created rather than opening a second flow.

use std::net::Ipv4Addr;

use tracing::{debug, error};

use crate::core::packet::PROTO_ICMP;
use crate::core::{CapturePacket, ConnectionEvent, Transport};
use crate::sink::EventSink;

use super::addrs_match;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IcmpState {
    Active,
    Closed,
}

#[derive(Debug, Clone)]
struct IcmpEntry {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    state: IcmpState,
    first_seen_s: u64,
    first_seen_us: u32,
    last_active_s: u64,
    last_active_us: u32,
    msgtype: u8,
    seqnum: u16,
}

impl IcmpEntry {
    fn last_active_micros(&self) -> u64 {
        self.last_active_s * 1_000_000 + u64::from(self.last_active_us)
    }

    fn to_event(&self) -> ConnectionEvent {
        let mut ev = ConnectionEvent {
            fingerprint: [0; 16],
            src: u32::from(self.src),
            dst: u32::from(self.dst),
            protocol: u16::from(PROTO_ICMP),
            l4_protocol: u16::from(PROTO_ICMP),
            l4_src: 0,
            l4_dst: 0,
            timestamp_s: self.first_seen_s,
            timestamp_us: self.first_seen_us,
            end_timestamp_s: 0,
            end_timestamp_us: 0,
            msgtype: i32::from(self.msgtype),
            seqnum: i32::from(self.seqnum),
        };
        ev.update_fingerprint();
        ev
    }
}

/// Tracks ICMP exchanges keyed by the symmetric IPv4 pair.
pub struct IcmpTracker {
    entries: Vec<IcmpEntry>,
    timeout_us: u64,
    opened: u64,
    closed: u64,
}

impl IcmpTracker {
    pub fn new(timeout_us: u64) -> Self {
        Self {
            entries: Vec::new(),
            timeout_us,
            opened: 0,
            closed: 0,
        }
    }

    /// Human-readable name for an ICMP type number. Log output only; the
    /// wire event always carries the raw number.
    pub fn type_name(icmp_type: u8) -> &'static str {
        match icmp_type {
            0 => "ECHO_REPLY",
            3 => "DEST_UNREACHABLE",
            4 => "SOURCE_QUENCH",
            5 => "REDIRECT",
            6 => "ALT_HOST",
            8 => "ECHO_REQUEST",
            9 => "ROUTER_ADVERTISEMENT",
            10 => "ROUTER_SOLICITATION",
            11 => "TIME_EXCEEDED",
            12 => "PARAM_PROBLEM",
            13 => "TIMESTAMP_REQUEST",
            14 => "TIMESTAMP_REPLY",
            15 => "INFO_REQUEST",
            16 => "INFO_REPLY",
            17 => "ADDRESS_MASK_REQUEST",
            18 => "ADDRESS_MASK_REPLY",
            30 => "TRACEROUTE",
            31 => "DGM_CONVERT_ERROR",
            32 => "MOBILE_HOST_REDIR",
            42 => "EXTENDED_ECHO_REQ",
            43 => "EXTENDED_ECHO_REPLY",
            _ => "",
        }
    }

    /// Advance the state machine for one ICMP message.
    pub fn on_packet(&mut self, pkt: &CapturePacket, sink: &mut dyn EventSink) {
        let Transport::Icmp { icmp_type, seq, .. } = pkt.transport else {
            return;
        };

        let timeout_us = self.timeout_us;
        let now_us = pkt.micros();

        let found = self
            .entries
            .iter_mut()
            .find(|e| addrs_match((e.src, e.dst), (pkt.src, pkt.dst)));

        if let Some(entry) = found {
            if entry.state == IcmpState::Closed {
                return;
            }

            if entry.last_active_micros() + timeout_us > now_us {
                entry.last_active_s = pkt.timestamp_s;
                entry.last_active_us = pkt.timestamp_us;
            } else {
                let mut ev = entry.to_event();
                ev.end_timestamp_s = pkt.timestamp_s;
                ev.end_timestamp_us = pkt.timestamp_us;
                entry.state = IcmpState::Closed;

                debug!(
                    "ICMP CLOSE {}: {} -> {} type={:#04x}/{} seq={}",
                    ev.fingerprint_hex(),
                    ev.src_addr(),
                    ev.dst_addr(),
                    entry.msgtype,
                    Self::type_name(entry.msgtype),
                    entry.seqnum
                );

                self.closed += 1;

                if let Err(e) = sink.report_close(&ev) {
                    error!("Unable to deliver close notification: {}", e);
                }
            }
        } else {
            let entry = IcmpEntry {
                src: pkt.src,
                dst: pkt.dst,
                state: IcmpState::Active,
                first_seen_s: pkt.timestamp_s,
                first_seen_us: pkt.timestamp_us,
                last_active_s: pkt.timestamp_s,
                last_active_us: pkt.timestamp_us,
                msgtype: icmp_type,
                seqnum: seq,
            };
            let ev = entry.to_event();

            debug!(
                "ICMP OPEN  {}: {} -> {} type={:#04x}/{} seq={}",
                ev.fingerprint_hex(),
                ev.src_addr(),
                ev.dst_addr(),
                entry.msgtype,
                Self::type_name(entry.msgtype),
                entry.seqnum
            );

            self.entries.push(entry);
            self.opened += 1;

            if let Err(e) = sink.report_open(&ev) {
                error!("Unable to deliver open notification: {}", e);
            }
        }
    }

    /// Remove closed entries and expire idle ones, as for UDP.
    pub fn prune(&mut self, last_s: u64, last_us: u32, sink: &mut dyn EventSink) {
        let timeout_us = self.timeout_us;
        let last_micros = last_s * 1_000_000 + u64::from(last_us);
        let mut closed = 0u64;

        self.entries.retain(|e| {
            if e.state == IcmpState::Closed {
                return false;
            }
            if e.last_active_micros() + timeout_us < last_micros {
                let mut ev = e.to_event();
                ev.end_timestamp_s = last_s;
                ev.end_timestamp_us = last_us;

                debug!(
                    "ICMP CLOSE {}: {} -> {} type={:#04x}/{} seq={} (idle)",
                    ev.fingerprint_hex(),
                    ev.src_addr(),
                    ev.dst_addr(),
                    e.msgtype,
                    Self::type_name(e.msgtype),
                    e.seqnum
                );

                closed += 1;

                if let Err(e) = sink.report_close(&ev) {
                    error!("Unable to deliver close notification: {}", e);
                }
                return false;
            }
            true
        });

        self.closed += closed;
    }

    /// Close every remaining exchange at end of input.
    pub fn drain_residual(&mut self, end_s: u64, end_us: u32, sink: &mut dyn EventSink) {
        let mut closed = 0u64;
        for entry in self.entries.drain(..) {
            if entry.state == IcmpState::Closed {
                continue;
            }
            let mut ev = entry.to_event();
            ev.end_timestamp_s = end_s;
            ev.end_timestamp_us = end_us;

            debug!(
                "ICMP CLOSE {}: {} -> {} type={:#04x}/{} seq={} (residual)",
                ev.fingerprint_hex(),
                ev.src_addr(),
                ev.dst_addr(),
                entry.msgtype,
                Self::type_name(entry.msgtype),
                entry.seqnum
            );

            closed += 1;

            if let Err(e) = sink.report_close(&ev) {
                error!("Unable to deliver close notification: {}", e);
            }
        }
        self.closed += closed;
    }

    pub fn opened(&self) -> u64 {
        self.opened
    }

    pub fn closed(&self) -> u64 {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
