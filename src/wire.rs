//! Packet layout and byte-order rules for the multicast reflash stream.
//!
//! Every packet is a fixed-size header followed by a fixed-size payload (one
//! erasure-code symbol, or one placement-spec fragment padded out to symbol
//! size). All multi-byte header fields are network byte order.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::{DekuRead, DekuUpdate, DekuWrite};

/// Payload bytes per packet; sized to fit one Ethernet frame.
pub const PKT_SIZE: usize = 1310;

/// Encoded size of [`PacketHeader`] on the wire.
pub const HDR_SIZE: usize = 52;

/// Total on-wire packet size.
pub const WIRE_PKT_SIZE: usize = HDR_SIZE + PKT_SIZE;

/// CRC used for packet payloads, block contents, and the running image CRC:
/// init `0xffffffff`, reflected, no final xor (the classic mtd-utils `crc32`).
pub const PKT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Packets are grouped by block rather than interleaved round-robin. Affects
/// progress display and stop polling only; the receive state machine is the
/// same either way.
pub const BLOCK_MODE: u32 = 0x001;
/// A partition-map packet is expected before data may be placed.
pub const PARTITION_MODE: u32 = 0x002;
/// This packet carries the partition map.
pub const PARTITION_SPEC: u32 = 0x004;
/// A placement/security spec stream is present.
pub const PLACEMENT_MODE: u32 = 0x008;
/// This packet carries a placement-spec fragment.
pub const PLACEMENT_SPEC: u32 = 0x010;
/// The partition wants clean markers written to its unused blocks.
pub const CLEANMARKERS_MODE: u32 = 0x100;
/// Opaque-image mode: blocks land at the tail of the device and validation is
/// deferred to an external post-processing step.
pub const ZDATA_MODE: u32 = 0x200;

/// How many data packets between placement-spec fragments in the sender's
/// output stream.
pub const PLACEMENT_INTERVAL: u32 = 32;

/// The fixed packet header. Field order matches the wire exactly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct PacketHeader {
    pub mode: u32,
    /// CRC over the whole image; zero until the sender has completed one pass.
    pub total_crc: u32,
    pub nr_blocks: u32,
    pub block_size: u32,
    pub block_crc: u32,
    pub block_nr: u32,
    /// Monotonically increasing across all packets, for loss estimation.
    pub sequence: u32,
    /// Erasure-code symbol index within the block.
    pub pkt_nr: u16,
    /// Total symbols sent per block (data + redundancy).
    pub nr_pkts: u16,
    /// Meaningful payload bytes in this packet.
    pub this_len: u32,
    /// CRC over the full padded payload.
    pub this_crc: u32,
    pub placement_nr_pkts: u16,
    pub placement_pkt_nr: u16,
    pub placement_image_len: u32,
    pub placement_signature_len: u32,
}

impl PacketHeader {
    pub fn has(&self, flag: u32) -> bool {
        self.mode & flag != 0
    }

    /// Split a received datagram into header and payload.
    ///
    /// Returns None for runts and undecodable headers; those are counted by the
    /// caller, never fatal.
    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < WIRE_PKT_SIZE {
            return None;
        }
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;
        Some((header, &buf[HDR_SIZE..WIRE_PKT_SIZE]))
    }

    /// Serialize this header plus a payload (padded with zeros to [`PKT_SIZE`])
    /// into one on-wire packet.
    pub fn emit(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(payload.len() <= PKT_SIZE, "payload too large");
        let mut pkt = self.to_bytes()?;
        debug_assert_eq!(pkt.len(), HDR_SIZE);
        pkt.extend_from_slice(payload);
        pkt.resize(WIRE_PKT_SIZE, 0);
        Ok(pkt)
    }
}

#[test]
fn test_header_round_trip() {
    let hdr = PacketHeader {
        mode: BLOCK_MODE | CLEANMARKERS_MODE,
        total_crc: 0xdead_beef,
        nr_blocks: 80,
        block_size: 0x20000,
        block_crc: 0x1234_5678,
        block_nr: 3,
        sequence: 99,
        pkt_nr: 7,
        nr_pkts: 120,
        this_len: PKT_SIZE as u32,
        this_crc: 0,
        ..Default::default()
    };

    let pkt = hdr.emit(&[0xAA; 16]).unwrap();
    assert_eq!(pkt.len(), WIRE_PKT_SIZE);

    // Spot-check network byte order: `mode` occupies the first four bytes.
    assert_eq!(&pkt[..4], &[0x00, 0x00, 0x01, 0x01]);

    let (decoded, payload) = PacketHeader::parse(&pkt).unwrap();
    assert_eq!(decoded, hdr);
    assert_eq!(&payload[..16], &[0xAA; 16]);
    assert!(payload[16..].iter().all(|&x| x == 0));
}

#[test]
fn test_parse_rejects_runt() {
    assert!(PacketHeader::parse(&[0u8; HDR_SIZE]).is_none());
    assert!(PacketHeader::parse(&[0u8; WIRE_PKT_SIZE - 1]).is_none());
}
