//! Capture-file driver
//!
//! Walks the input directory for capture files, feeds each packet through
//! the decoder and the connection tracker, and drives the per-file flush
//! and prune cycle. File-scoped failures are logged and the run moves on
//! to the next file; nothing here aborts a whole run.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use pcap_file::pcap::PcapReader;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::core::{CapturePacket, TcpFlags, Transport};
use crate::error::{CapmetaError, Result};
use crate::sink::EventSink;
use crate::tracker::ConnectionTracker;

/// Totals accumulated across a whole run.
#[derive(Debug, Default)]
pub struct RunStats {
    /// Every packet read from every capture file, decodable or not.
    pub total_packets: u64,
    pub files_processed: usize,
    pub files_failed: usize,
    /// Earliest packet timestamp seen across all files.
    pub first_seen: Option<(u64, u32)>,
    /// Latest packet timestamp seen across all files.
    pub last_seen: Option<(u64, u32)>,
}

impl RunStats {
    fn observe(&mut self, ts_s: u64, ts_us: u32) {
        let micros = ts_s * 1_000_000 + u64::from(ts_us);
        let earlier = self
            .first_seen
            .map_or(true, |(s, us)| micros < s * 1_000_000 + u64::from(us));
        if earlier {
            self.first_seen = Some((ts_s, ts_us));
        }
        let later = self
            .last_seen
            .map_or(true, |(s, us)| micros >= s * 1_000_000 + u64::from(us));
        if later {
            self.last_seen = Some((ts_s, ts_us));
        }
    }
}

/// Process every capture file under `directory` in natural-sorted order.
///
/// After each file: `sink.flush()`, then a prune pass stamped with the last
/// packet of that file. After the final file: `finalize` drains every
/// remaining flow, followed by a last flush.
pub fn run(
    directory: &Path,
    tracker: &mut ConnectionTracker,
    sink: &mut dyn EventSink,
) -> Result<RunStats> {
    let files = match list_capture_files(directory) {
        Ok(files) => files,
        Err(e) => {
            error!("Unable to read capture directory {}: {}", directory.display(), e);
            Vec::new()
        }
    };
    debug!("Processing {} capture files", files.len());

    let mut stats = RunStats::default();
    let mut last_packet: Option<CapturePacket> = None;

    for path in &files {
        match process_file(path, tracker, sink, &mut stats) {
            Ok(file_last) => {
                stats.files_processed += 1;
                if file_last.is_some() {
                    last_packet = file_last;
                }

                if let Err(e) = sink.flush() {
                    error!("Unable to flush notification sink: {}", e);
                }
                if let Some(last) = &last_packet {
                    tracker.prune(last.timestamp_s, last.timestamp_us, sink);
                }
            }
            Err(e) => {
                stats.files_failed += 1;
                error!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    if let Some(last) = &last_packet {
        tracker.finalize(last, sink);
    }
    if let Err(e) = sink.flush() {
        error!("Unable to flush notification sink: {}", e);
    }

    Ok(stats)
}

/// Regular files whose name contains `.pcap`, in natural-sorted order:
/// lexicographic, but a trailing digit run compares numerically so
/// `cap2.pcap` precedes `cap10.pcap`.
pub fn list_capture_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().contains(".pcap") {
            files.push(entry.path());
        }
    }

    let re = Regex::new(r"^(.*?)(\d+)(\D*)$").expect("static regex");
    files.sort_by_cached_key(|p| {
        let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        natural_sort_key(&name, &re)
    });

    Ok(files)
}

/// Split a file name around its last digit run for natural ordering.
fn natural_sort_key(name: &str, re: &Regex) -> (String, u64, String) {
    match re.captures(name) {
        Some(caps) => {
            let number = caps[2].parse().unwrap_or(u64::MAX);
            (caps[1].to_string(), number, caps[3].to_string())
        }
        None => (name.to_string(), 0, String::new()),
    }
}

/// Read one capture file, returning the last decoded packet.
///
/// A reader error mid-file aborts that file (the packets already seen
/// stand); the caller moves on to the next file.
fn process_file(
    path: &Path,
    tracker: &mut ConnectionTracker,
    sink: &mut dyn EventSink,
    stats: &mut RunStats,
) -> Result<Option<CapturePacket>> {
    let file = File::open(path)?;
    let mut reader = PcapReader::new(BufReader::new(file))
        .map_err(|e| CapmetaError::ParseError(e.to_string()))?;

    let mut file_packets = 0u64;
    let mut last_packet = None;

    while let Some(next) = reader.next_packet() {
        let raw = match next {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Decoder error in {}, aborting file: {}", path.display(), e);
                break;
            }
        };

        file_packets += 1;

        let ts_s = raw.timestamp.as_secs();
        let ts_us = raw.timestamp.subsec_micros();
        stats.observe(ts_s, ts_us);

        match decode_packet(&raw.data, ts_s, ts_us) {
            Ok(pkt) => {
                tracker.on_packet(&pkt, sink);
                last_packet = Some(pkt);
            }
            // Non-IP traffic (ARP and friends) is expected; skip it.
            Err(CapmetaError::NoIpv4Layer) => {}
            Err(e) => {
                debug!("Dropping undecodable packet in {}: {}", path.display(), e);
            }
        }
    }

    stats.total_packets += file_packets;
    debug!("{:>10} packets in {}", file_packets, path.display());

    Ok(last_packet)
}

/// Decode an ethernet frame into the tracker's packet model.
///
/// Anything without an IPv4 layer is rejected; transports other than
/// TCP/UDP/ICMP come back as [`Transport::Other`] for the dispatcher to
/// count and drop.
pub fn decode_packet(data: &[u8], ts_s: u64, ts_us: u32) -> Result<CapturePacket> {
    use etherparse::{Icmpv4Type, InternetSlice, SlicedPacket, TransportSlice};

    let sliced = SlicedPacket::from_ethernet(data)
        .map_err(|e| CapmetaError::ParseError(e.to_string()))?;

    let (src, dst, ip_protocol) = match &sliced.net {
        Some(InternetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                header.source_addr(),
                header.destination_addr(),
                header.protocol().0,
            )
        }
        _ => return Err(CapmetaError::NoIpv4Layer),
    };

    let transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Transport::Tcp {
            sport: tcp.source_port(),
            dport: tcp.destination_port(),
            flags: TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                ack: tcp.ack(),
            },
        },
        Some(TransportSlice::Udp(udp)) => Transport::Udp {
            sport: udp.source_port(),
            dport: udp.destination_port(),
        },
        Some(TransportSlice::Icmpv4(icmp)) => {
            let header = icmp.header();
            let seq = match header.icmp_type {
                Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => echo.seq,
                _ => 0,
            };
            Transport::Icmp {
                icmp_type: icmp.type_u8(),
                code: icmp.code_u8(),
                seq,
            }
        }
        _ => Transport::Other { protocol: ip_protocol },
    };

    Ok(CapturePacket {
        timestamp_s: ts_s,
        timestamp_us: ts_us,
        src,
        dst,
        transport,
    })
}

/// Format a split timestamp the way the run summary prints it.
pub fn timestamp_to_string(ts_s: u64, ts_us: u32) -> String {
    use chrono::{Local, LocalResult, TimeZone};

    match Local.timestamp_opt(ts_s as i64, ts_us * 1000) {
        LocalResult::Single(dt) => dt.format("%H:%M:%S%.6f %m/%d/%Y").to_string(),
        _ => format!("{}.{:06}", ts_s, ts_us),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> (String, u64, String) {
        let re = Regex::new(r"^(.*?)(\d+)(\D*)$").unwrap();
        natural_sort_key(name, &re)
    }

    #[test]
    fn test_natural_key_orders_trailing_numbers() {
        assert!(key("cap2.pcap") < key("cap10.pcap"));
        assert!(key("cap9.pcap") < key("cap10.pcap"));
        assert!(key("trace.pcap1") < key("trace.pcap12"));
    }

    #[test]
    fn test_natural_key_plain_names() {
        assert!(key("alpha.pcap") < key("beta.pcap"));
        // A numberless name sorts by its full text.
        assert_eq!(key("capture.pcap").1, 0);
    }

    #[test]
    fn test_natural_key_prefix_dominates() {
        assert!(key("a2.pcap") < key("b1.pcap"));
    }

    #[test]
    fn test_run_stats_observe() {
        let mut stats = RunStats::default();
        stats.observe(2000, 500_000);
        stats.observe(1999, 999_999);
        stats.observe(2001, 0);

        assert_eq!(stats.first_seen, Some((1999, 999_999)));
        assert_eq!(stats.last_seen, Some((2001, 0)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_packet(&[], 0, 0).is_err());
        assert!(decode_packet(&[0u8; 10], 0, 0).is_err());
    }

    #[test]
    fn test_decode_tcp_frame() {
        use etherparse::PacketBuilder;

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .tcp(80, 40000, 1, 1024);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let pkt = decode_packet(&frame, 1000, 42).expect("decodes");
        assert_eq!(pkt.timestamp_s, 1000);
        assert_eq!(pkt.timestamp_us, 42);
        assert_eq!(pkt.src, std::net::Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pkt.dst, std::net::Ipv4Addr::new(10, 0, 0, 1));
        match pkt.transport {
            Transport::Tcp { sport, dport, .. } => {
                assert_eq!(sport, 80);
                assert_eq!(dport, 40000);
            }
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn test_decode_udp_frame() {
        use etherparse::PacketBuilder;

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(53, 1234);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let pkt = decode_packet(&frame, 0, 0).expect("decodes");
        assert_eq!(pkt.transport, Transport::Udp { sport: 53, dport: 1234 });
    }

    #[test]
    fn test_decode_non_ipv4_is_skippable() {
        use etherparse::PacketBuilder;

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv6([1; 16], [2; 16], 64)
            .udp(53, 1234);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let err = decode_packet(&frame, 0, 0).unwrap_err();
        assert!(matches!(err, CapmetaError::NoIpv4Layer));
    }

    #[test]
    fn test_decode_unknown_transport_reaches_dispatcher() {
        use etherparse::{IpNumber, PacketBuilder};

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, IpNumber(47), &[]).unwrap();

        let pkt = decode_packet(&frame, 0, 0).expect("decodes");
        assert_eq!(pkt.transport, Transport::Other { protocol: 47 });
    }

    #[test]
    fn test_decode_icmp_echo() {
        use etherparse::PacketBuilder;

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .icmpv4_echo_request(99, 7);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let pkt = decode_packet(&frame, 0, 0).expect("decodes");
        assert_eq!(
            pkt.transport,
            Transport::Icmp { icmp_type: 8, code: 0, seq: 7 }
        );
    }
}
