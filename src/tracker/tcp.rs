//! TCP connection tracker
//!
//! Flag-driven state machine reduced to the two transitions the capture
//! stream actually lets us observe: a SYN+ACK proves a listener accepted
//! the connection (open), a FIN in either direction ends it (close). No
//! idle timeout applies; closure is observed, not inferred.

use std::net::Ipv4Addr;

use tracing::{debug, error};

use crate::core::packet::PROTO_TCP;
use crate::core::{CapturePacket, ConnectionEvent, Transport};
use crate::sink::EventSink;

use super::{tuple_matches, MatchPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    /// Flow recognized, connection live.
    Listen,
    /// FIN observed; entry awaits pruning.
    Closed,
}

#[derive(Debug, Clone)]
struct TcpEntry {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    state: TcpState,
    first_seen_s: u64,
    first_seen_us: u32,
    last_active_s: u64,
    last_active_us: u32,
}

impl TcpEntry {
    fn to_event(&self) -> ConnectionEvent {
        let mut ev = ConnectionEvent {
            fingerprint: [0; 16],
            src: u32::from(self.src),
            dst: u32::from(self.dst),
            protocol: u16::from(PROTO_TCP),
            l4_protocol: u16::from(PROTO_TCP),
            l4_src: self.sport,
            l4_dst: self.dport,
            timestamp_s: self.first_seen_s,
            timestamp_us: self.first_seen_us,
            end_timestamp_s: 0,
            end_timestamp_us: 0,
            msgtype: 0,
            seqnum: 0,
        };
        ev.update_fingerprint();
        ev
    }
}

/// Tracks TCP flows keyed by the symmetric address/port tuple.
pub struct TcpTracker {
    entries: Vec<TcpEntry>,
    policy: MatchPolicy,
    opened: u64,
    closed: u64,
}

impl TcpTracker {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
            opened: 0,
            closed: 0,
        }
    }

    /// Advance the state machine for one TCP segment.
    pub fn on_packet(&mut self, pkt: &CapturePacket, sink: &mut dyn EventSink) {
        let Transport::Tcp { sport, dport, flags } = pkt.transport else {
            return;
        };

        let policy = self.policy;
        let found = self.entries.iter_mut().find(|e| {
            tuple_matches(
                policy,
                (e.src, e.dst, e.sport, e.dport),
                (pkt.src, pkt.dst, sport, dport),
            )
        });

        if let Some(entry) = found {
            entry.last_active_s = pkt.timestamp_s;
            entry.last_active_us = pkt.timestamp_us;

            if entry.state != TcpState::Closed && flags.is_fin() {
                let mut ev = entry.to_event();
                ev.end_timestamp_s = pkt.timestamp_s;
                ev.end_timestamp_us = pkt.timestamp_us;
                entry.state = TcpState::Closed;

                debug!(
                    "TCP CLOSE {}: {}:{} -> {}:{}",
                    ev.fingerprint_hex(),
                    ev.src_addr(),
                    ev.l4_src,
                    ev.dst_addr(),
                    ev.l4_dst
                );

                self.closed += 1;

                if let Err(e) = sink.report_close(&ev) {
                    error!("Unable to deliver close notification: {}", e);
                }
            }
        } else if flags.is_syn_ack() {
            // The SYN+ACK sender is the accepting side; the entry and both
            // of its events record the flow from that side.
            let entry = TcpEntry {
                src: pkt.src,
                dst: pkt.dst,
                sport,
                dport,
                state: TcpState::Listen,
                first_seen_s: pkt.timestamp_s,
                first_seen_us: pkt.timestamp_us,
                last_active_s: pkt.timestamp_s,
                last_active_us: pkt.timestamp_us,
            };
            let ev = entry.to_event();
            self.entries.push(entry);

            debug!(
                "TCP OPEN  {}: {}:{} -> {}:{}",
                ev.fingerprint_hex(),
                ev.src_addr(),
                ev.l4_src,
                ev.dst_addr(),
                ev.l4_dst
            );

            self.opened += 1;

            if let Err(e) = sink.report_open(&ev) {
                error!("Unable to deliver open notification: {}", e);
            }
        }
    }

    /// Drop entries whose close has already been observed and emitted.
    pub fn prune(&mut self) {
        self.entries.retain(|e| e.state != TcpState::Closed);
    }

    /// Close every remaining flow at end of input.
    pub fn drain_residual(&mut self, end_s: u64, end_us: u32, sink: &mut dyn EventSink) {
        for entry in self.entries.drain(..) {
            let mut ev = entry.to_event();
            ev.end_timestamp_s = end_s;
            ev.end_timestamp_us = end_us;

            debug!(
                "TCP CLOSE {}: {}:{} -> {}:{} (residual)",
                ev.fingerprint_hex(),
                ev.src_addr(),
                ev.l4_src,
                ev.dst_addr(),
                ev.l4_dst
            );

            self.closed += 1;

            if let Err(e) = sink.report_close(&ev) {
                error!("Unable to deliver close notification: {}", e);
            }
        }
    }

    pub fn opened(&self) -> u64 {
        self.opened
    }

    pub fn closed(&self) -> u64 {
        self.closed
    }

    /// Number of entries currently held, pruned or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
