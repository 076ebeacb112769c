//! Directory-to-sink runs over synthesized capture files.

use std::fs::File;
use std::time::Duration;

use etherparse::PacketBuilder;
use pcap_file::pcap::{PcapPacket, PcapWriter};
use tempfile::TempDir;

use capmeta::capture::{self, list_capture_files};
use capmeta::sink::MemorySink;
use capmeta::tracker::{ConnectionTracker, MatchPolicy};

const TIMEOUT_US: u64 = 1_000_000;

fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 1024);
    let builder = if flags & 0x02 != 0 { builder.syn() } else { builder };
    let builder = if flags & 0x10 != 0 { builder.ack(1) } else { builder };
    let builder = if flags & 0x01 != 0 { builder.fin() } else { builder };
    let mut frame = Vec::with_capacity(builder.size(0));
    builder.write(&mut frame, &[]).unwrap();
    frame
}

fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut frame = Vec::with_capacity(builder.size(0));
    builder.write(&mut frame, &[]).unwrap();
    frame
}

fn write_pcap(path: &std::path::Path, packets: &[(u64, u32, Vec<u8>)]) {
    let file = File::create(path).unwrap();
    let mut writer = PcapWriter::new(file).unwrap();
    for (ts_s, ts_us, data) in packets {
        let timestamp = Duration::new(*ts_s, ts_us * 1000);
        writer
            .write_packet(&PcapPacket::new(timestamp, data.len() as u32, data))
            .unwrap();
    }
}

#[test]
fn run_over_two_files() {
    let dir = TempDir::new().unwrap();

    // File 1: TCP handshake accept + UDP query.
    write_pcap(
        &dir.path().join("trace1.pcap"),
        &[
            (1000, 0, tcp_frame([10, 0, 0, 2], 80, [10, 0, 0, 1], 40000, 0x12)),
            (1000, 200_000, udp_frame([10, 0, 0, 1], 53, [10, 0, 0, 2], 1234)),
        ],
    );

    // File 2: the TCP close arrives in a later capture.
    write_pcap(
        &dir.path().join("trace2.pcap"),
        &[(1000, 500_000, tcp_frame([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80, 0x01))],
    );

    let mut tracker = ConnectionTracker::new(TIMEOUT_US, "", MatchPolicy::Loose);
    let mut sink = MemorySink::new();

    let stats = capture::run(dir.path(), &mut tracker, &mut sink).unwrap();

    assert_eq!(stats.total_packets, 3);
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.files_failed, 0);
    assert_eq!(stats.first_seen, Some((1000, 0)));
    assert_eq!(stats.last_seen, Some((1000, 500_000)));

    // TCP flow survived the file boundary and closed on the FIN.
    assert_eq!(tracker.tcp().opened(), 1);
    assert_eq!(tracker.tcp().closed(), 1);

    // The UDP flow was still live at end of input; finalize closed it.
    assert_eq!(tracker.udp().opened(), 1);
    assert_eq!(tracker.udp().closed(), 1);

    assert_eq!(sink.opens.len(), 2);
    assert_eq!(sink.closes.len(), 2);

    // One flush per file plus the final one.
    assert_eq!(sink.flushes, 3);

    // Nothing lives past the run.
    assert_eq!(tracker.tcp().len(), 0);
    assert_eq!(tracker.udp().len(), 0);
}

#[test]
fn unreadable_file_is_skipped() {
    let dir = TempDir::new().unwrap();

    std::fs::write(dir.path().join("broken.pcap"), b"not a capture").unwrap();
    write_pcap(
        &dir.path().join("good.pcap"),
        &[(2000, 0, udp_frame([10, 0, 0, 1], 53, [10, 0, 0, 2], 1234))],
    );

    let mut tracker = ConnectionTracker::new(TIMEOUT_US, "", MatchPolicy::Loose);
    let mut sink = MemorySink::new();

    let stats = capture::run(dir.path(), &mut tracker, &mut sink).unwrap();

    assert_eq!(stats.files_failed, 1);
    assert_eq!(stats.files_processed, 1);
    assert_eq!(tracker.udp().opened(), 1);
}

#[test]
fn directory_listing_is_natural_sorted() {
    let dir = TempDir::new().unwrap();

    for name in ["cap10.pcap", "cap2.pcap", "cap1.pcap", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let files = list_capture_files(dir.path()).unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();

    assert_eq!(names, vec!["cap1.pcap", "cap2.pcap", "cap10.pcap"]);
}

#[test]
fn empty_directory_is_a_clean_run() {
    let dir = TempDir::new().unwrap();

    let mut tracker = ConnectionTracker::new(TIMEOUT_US, "", MatchPolicy::Loose);
    let mut sink = MemorySink::new();

    let stats = capture::run(dir.path(), &mut tracker, &mut sink).unwrap();

    assert_eq!(stats.total_packets, 0);
    assert!(stats.first_seen.is_none());
    // No packets means nothing to finalize, but the closing flush still runs.
    assert_eq!(sink.flushes, 1);
}
