//! Connection tracking engine
//!
//! Reconstructs per-flow connection state from the decoded packet stream
//! and emits open/close notifications through the sink. One tracker per
//! transport; the [`ConnectionTracker`] dispatcher routes packets to
//! whichever trackers are enabled and drives end-of-input pruning.
//!
//! # Example
//!
//! ```ignore
//! use capmeta::tracker::{ConnectionTracker, MatchPolicy};
//! use capmeta::sink::MemorySink;
//!
//! let mut tracker = ConnectionTracker::new(1_000_000, "", MatchPolicy::Loose);
//! let mut sink = MemorySink::new();
//!
//! for pkt in packets {
//!     tracker.on_packet(&pkt, &mut sink);
//! }
//! tracker.finalize(&last_packet, &mut sink);
//! ```

pub mod icmp;
pub mod tcp;
pub mod udp;

use std::net::Ipv4Addr;

use tracing::debug;

use crate::core::{CapturePacket, Transport};
use crate::sink::EventSink;

pub use icmp::IcmpTracker;
pub use tcp::TcpTracker;
pub use udp::UdpTracker;

/// How packets are matched to existing flow entries.
///
/// `Loose` is the historical policy: the IPv4 pair must match in either
/// order and any single port comparison out of the four cross-pairings is
/// enough. That coalesces unrelated flows that share an endpoint and one
/// port. `Strict` requires the full 4-tuple to match with a consistent
/// orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    #[default]
    Loose,
    Strict,
}

/// True when the packet's address pair equals the entry's in either order.
pub(crate) fn addrs_match(
    entry: (Ipv4Addr, Ipv4Addr),
    packet: (Ipv4Addr, Ipv4Addr),
) -> bool {
    entry == packet || entry == (packet.1, packet.0)
}

/// Port comparison under the given policy.
///
/// For `Strict` the ports must line up with the same orientation the
/// addresses matched under, so the caller passes both tuples whole.
pub(crate) fn tuple_matches(
    policy: MatchPolicy,
    entry: (Ipv4Addr, Ipv4Addr, u16, u16),
    packet: (Ipv4Addr, Ipv4Addr, u16, u16),
) -> bool {
    let (es, ed, esp, edp) = entry;
    let (ps, pd, psp, pdp) = packet;

    match policy {
        MatchPolicy::Loose => {
            addrs_match((es, ed), (ps, pd))
                && (esp == psp || edp == pdp || esp == pdp || edp == psp)
        }
        MatchPolicy::Strict => {
            (es == ps && ed == pd && esp == psp && edp == pdp)
                || (es == pd && ed == ps && esp == pdp && edp == psp)
        }
    }
}

/// Routes packets to the per-protocol trackers and owns end-of-input
/// finalization.
pub struct ConnectionTracker {
    tcp: TcpTracker,
    udp: UdpTracker,
    icmp: IcmpTracker,
    enable_tcp: bool,
    enable_udp: bool,
    enable_icmp: bool,
    packet_count: u64,
}

impl ConnectionTracker {
    /// Create a dispatcher with all three trackers.
    ///
    /// `disable` is a comma-tolerant list; the presence of `tcp`, `udp`, or
    /// `icmp` anywhere in the string turns that tracker off.
    pub fn new(timeout_us: u64, disable: &str, policy: MatchPolicy) -> Self {
        let enable_tcp = !disable.contains("tcp");
        let enable_udp = !disable.contains("udp");
        let enable_icmp = !disable.contains("icmp");

        if !enable_tcp || !enable_udp || !enable_icmp {
            debug!(
                "Tracker enablement: tcp={} udp={} icmp={}",
                enable_tcp, enable_udp, enable_icmp
            );
        }

        Self {
            tcp: TcpTracker::new(policy),
            udp: UdpTracker::new(timeout_us, policy),
            icmp: IcmpTracker::new(timeout_us),
            enable_tcp,
            enable_udp,
            enable_icmp,
            packet_count: 0,
        }
    }

    /// Route one packet to the tracker for its transport, if enabled.
    pub fn on_packet(&mut self, pkt: &CapturePacket, sink: &mut dyn EventSink) {
        match pkt.transport {
            Transport::Tcp { .. } if self.enable_tcp => self.tcp.on_packet(pkt, sink),
            Transport::Udp { .. } if self.enable_udp => self.udp.on_packet(pkt, sink),
            Transport::Icmp { .. } if self.enable_icmp => self.icmp.on_packet(pkt, sink),
            _ => {}
        }
        self.packet_count += 1;
    }

    /// Per-file pruning pass.
    ///
    /// TCP pruning is state-driven only; UDP and ICMP drop entries idle
    /// past the timeout relative to the last observed packet time, emitting
    /// the close those entries never got.
    pub fn prune(&mut self, last_s: u64, last_us: u32, sink: &mut dyn EventSink) {
        self.tcp.prune();
        self.udp.prune(last_s, last_us, sink);
        self.icmp.prune(last_s, last_us, sink);
    }

    /// End-of-input cleanup: prune, then close every flow still live.
    ///
    /// Residual closes carry the last packet's timestamp as their end time.
    /// Afterwards no tracker holds any entry.
    pub fn finalize(&mut self, last_packet: &CapturePacket, sink: &mut dyn EventSink) {
        let (last_s, last_us) = (last_packet.timestamp_s, last_packet.timestamp_us);
        self.prune(last_s, last_us, sink);
        self.tcp.drain_residual(last_s, last_us, sink);
        self.udp.drain_residual(last_s, last_us, sink);
        self.icmp.drain_residual(last_s, last_us, sink);
    }

    /// Total packets routed through the dispatcher.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn tcp(&self) -> &TcpTracker {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpTracker {
        &self.udp
    }

    pub fn icmp(&self) -> &IcmpTracker {
        &self.icmp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TcpFlags;
    use crate::sink::MemorySink;

    fn tcp_packet(ts: u64, flags: u8) -> CapturePacket {
        CapturePacket {
            timestamp_s: ts,
            timestamp_us: 0,
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            transport: Transport::Tcp {
                sport: 80,
                dport: 40000,
                flags: TcpFlags::from_u8(flags),
            },
        }
    }

    fn udp_packet(ts: u64) -> CapturePacket {
        CapturePacket {
            timestamp_s: ts,
            timestamp_us: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            transport: Transport::Udp { sport: 53, dport: 1234 },
        }
    }

    #[test]
    fn test_addrs_match_symmetric() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        let c = Ipv4Addr::new(10, 0, 0, 3);
        assert!(addrs_match((a, b), (a, b)));
        assert!(addrs_match((a, b), (b, a)));
        assert!(!addrs_match((a, b), (a, c)));
    }

    #[test]
    fn test_loose_matching_accepts_single_port() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        // Only one of the four port comparisons holds.
        assert!(tuple_matches(
            MatchPolicy::Loose,
            (a, b, 53, 1111),
            (a, b, 53, 2222)
        ));
        assert!(!tuple_matches(
            MatchPolicy::Strict,
            (a, b, 53, 1111),
            (a, b, 53, 2222)
        ));
    }

    #[test]
    fn test_strict_matching_reversed() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        assert!(tuple_matches(
            MatchPolicy::Strict,
            (a, b, 53, 1234),
            (b, a, 1234, 53)
        ));
        // Same addresses reversed but ports kept forward.
        assert!(!tuple_matches(
            MatchPolicy::Strict,
            (a, b, 53, 1234),
            (b, a, 53, 1234)
        ));
    }

    #[test]
    fn test_disabled_protocol_is_ignored() {
        let mut tracker = ConnectionTracker::new(1_000_000, "udp", MatchPolicy::Loose);
        let mut sink = MemorySink::new();

        tracker.on_packet(&udp_packet(2000), &mut sink);

        assert_eq!(tracker.udp().opened(), 0);
        assert_eq!(tracker.udp().closed(), 0);
        assert!(sink.opens.is_empty());
        // The dispatcher still counts the packet.
        assert_eq!(tracker.packet_count(), 1);
    }

    #[test]
    fn test_comma_tolerant_disable() {
        let tracker = ConnectionTracker::new(1_000_000, "tcp, icmp", MatchPolicy::Loose);
        assert!(!tracker.enable_tcp);
        assert!(tracker.enable_udp);
        assert!(!tracker.enable_icmp);
    }

    #[test]
    fn test_finalize_empty_is_noop() {
        let mut tracker = ConnectionTracker::new(1_000_000, "", MatchPolicy::Loose);
        let mut sink = MemorySink::new();
        tracker.finalize(&udp_packet(2000), &mut sink);
        assert!(sink.opens.is_empty());
        assert!(sink.closes.is_empty());
    }

    #[test]
    fn test_finalize_leaves_no_entries() {
        let mut tracker = ConnectionTracker::new(1_000_000, "", MatchPolicy::Loose);
        let mut sink = MemorySink::new();

        tracker.on_packet(&tcp_packet(1000, 0x12), &mut sink); // SYN+ACK
        tracker.on_packet(&udp_packet(1001), &mut sink);
        assert_eq!(sink.opens.len(), 2);

        tracker.finalize(&udp_packet(1002), &mut sink);
        assert_eq!(sink.closes.len(), 2);
        assert_eq!(tracker.tcp().len(), 0);
        assert_eq!(tracker.udp().len(), 0);
        assert_eq!(tracker.icmp().len(), 0);
    }
}
