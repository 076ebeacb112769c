//! UDP connection tracker
//!
//! UDP has no observable teardown, so liveness is inferred: a flow stays
//! open while matching packets keep arriving inside the idle timeout. The
//! first packet past the timeout closes the flow and is attributed as its
//! end time; it does not open a replacement flow.

use std::net::Ipv4Addr;

use tracing::{debug, error};

use crate::core::packet::PROTO_UDP;
use crate::core::{CapturePacket, ConnectionEvent, Transport};
use crate::sink::EventSink;

use super::{tuple_matches, MatchPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpState {
    Active,
    Closed,
}

#[derive(Debug, Clone)]
struct UdpEntry {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    state: UdpState,
    first_seen_s: u64,
    first_seen_us: u32,
    last_active_s: u64,
    last_active_us: u32,
}

impl UdpEntry {
    fn last_active_micros(&self) -> u64 {
        self.last_active_s * 1_000_000 + u64::from(self.last_active_us)
    }

    fn to_event(&self) -> ConnectionEvent {
        let mut ev = ConnectionEvent {
            fingerprint: [0; 16],
            src: u32::from(self.src),
            dst: u32::from(self.dst),
            protocol: u16::from(PROTO_UDP),
            l4_protocol: u16::from(PROTO_UDP),
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

/// Tracks UDP flows with idle-timeout liveness.
pub struct UdpTracker {
    entries: Vec<UdpEntry>,
    timeout_us: u64,
    policy: MatchPolicy,
    opened: u64,
    closed: u64,
}

impl UdpTracker {
    pub fn new(timeout_us: u64, policy: MatchPolicy) -> Self {
        Self {
            entries: Vec::new(),
            timeout_us,
            policy,
            opened: 0,
            closed: 0,
        }
    }

    /// Advance the state machine for one datagram.
    pub fn on_packet(&mut self, pkt: &CapturePacket, sink: &mut dyn EventSink) {
        let Transport::Udp { sport, dport } = pkt.transport else {
            return;
        };

        let timeout_us = self.timeout_us;
        let now_us = pkt.micros();

        let policy = self.policy;
        let found = self.entries.iter_mut().find(|e| {
            tuple_matches(
                policy,
                (e.src, e.dst, e.sport, e.dport),
                (pkt.src, pkt.dst, sport, dport),
            )
        });

        if let Some(entry) = found {
            if entry.state == UdpState::Closed {
                return;
            }

            // Still inside the idle window: extend. At or past the window:
            // the late packet closes the flow and opens nothing.
            if entry.last_active_micros() + timeout_us > now_us {
                entry.last_active_s = pkt.timestamp_s;
                entry.last_active_us = pkt.timestamp_us;
            } else {
                let mut ev = entry.to_event();
                ev.end_timestamp_s = pkt.timestamp_s;
                ev.end_timestamp_us = pkt.timestamp_us;
                entry.state = UdpState::Closed;

                debug!(
                    "UDP CLOSE {}: {}:{} -> {}:{}",
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
        } else {
            let entry = UdpEntry {
                src: pkt.src,
                dst: pkt.dst,
                sport,
                dport,
                state: UdpState::Active,
                first_seen_s: pkt.timestamp_s,
                first_seen_us: pkt.timestamp_us,
                last_active_s: pkt.timestamp_s,
                last_active_us: pkt.timestamp_us,
            };
            let ev = entry.to_event();
            self.entries.push(entry);

            debug!(
                "UDP OPEN  {}: {}:{} -> {}:{}",
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

    /// Remove closed entries and expire idle ones.
    ///
    /// Entries already closed had their close emitted when they expired;
    /// they are dropped silently. Live entries idle past the timeout
    /// relative to `last_s`/`last_us` get a close stamped with that time.
    pub fn prune(&mut self, last_s: u64, last_us: u32, sink: &mut dyn EventSink) {
        let timeout_us = self.timeout_us;
        let last_micros = last_s * 1_000_000 + u64::from(last_us);
        let mut closed = 0u64;

        self.entries.retain(|e| {
            if e.state == UdpState::Closed {
                return false;
            }
            if e.last_active_micros() + timeout_us < last_micros {
                let mut ev = e.to_event();
                ev.end_timestamp_s = last_s;
                ev.end_timestamp_us = last_us;

                debug!(
                    "UDP CLOSE {}: {}:{} -> {}:{} (idle)",
                    ev.fingerprint_hex(),
                    ev.src_addr(),
                    ev.l4_src,
                    ev.dst_addr(),
                    ev.l4_dst
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

    /// Close every remaining flow at end of input.
    pub fn drain_residual(&mut self, end_s: u64, end_us: u32, sink: &mut dyn EventSink) {
        let mut closed = 0u64;
        for entry in self.entries.drain(..) {
            if entry.state == UdpState::Closed {
                continue;
            }
            let mut ev = entry.to_event();
            ev.end_timestamp_s = end_s;
            ev.end_timestamp_us = end_us;

            debug!(
                "UDP CLOSE {}: {}:{} -> {}:{} (residual)",
                ev.fingerprint_hex(),
                ev.src_addr(),
                ev.l4_src,
                ev.dst_addr(),
                ev.l4_dst
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
