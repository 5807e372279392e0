//! The receive session: the state machine that turns a lossy multicast packet
//! stream back into NAND contents.
//!
//! Reception is two-phase. While packets arrive, accepted symbol payloads are
//! streamed straight to flash in arrival order (RAM only holds their symbol
//! indices and a sub-chunk staging buffer per block). Once every block has
//! enough symbols, a second pass reads each block back, erasure-decodes it,
//! verifies it against its digest or CRC, and rewrites it in decoded order.
//! A write failure at any point marks the block bad and restarts collection
//! in the owning partition's next good block.

mod eraseblock;

pub use eraseblock::EraseBlock;

use anyhow::{ensure, Context};
use tracing::{info, warn};

use crate::crypto::SpecCrypto;
use crate::error::ProtocolError;
use crate::fec::BlockCoder;
use crate::nand::{Nand, NandBlock};
use crate::partition::{assign_blocks, map_partitions, PartitionMap, PartitionTable};
use crate::placement::{PlacementBlob, SpecAssembler, SpecProgress};
use crate::placement::spec::{parse_spec, ParsedSpec};
use crate::transport::PacketSource;
use crate::wire::{
    PacketHeader, BLOCK_MODE, CLEANMARKERS_MODE, PARTITION_MODE, PARTITION_SPEC, PKT_CRC,
    PKT_SIZE, PLACEMENT_MODE, PLACEMENT_SPEC, ZDATA_MODE,
};

/// Polled by the session so a supervising thread can abort reception.
pub trait StopCheck {
    fn should_stop(&self) -> bool;
}

/// For callers with no supervision needs.
pub struct NeverStop;

impl StopCheck for NeverStop {
    fn should_stop(&self) -> bool {
        false
    }
}

impl StopCheck for std::sync::atomic::AtomicBool {
    fn should_stop(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Packet accounting over one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    /// Parseable packets received.
    pub total_pkts: u64,
    /// Packets whose symbol was already held.
    pub duplicates: u64,
    /// Packets discarded without error (complete block, gated, surplus).
    pub ignored: u64,
    /// Packets failing their payload CRC.
    pub bad_crc: u64,
    /// Sequence-number gaps, a lower bound on lost packets.
    pub missed: u64,
    /// Datagrams too short to carry a header.
    pub runts: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Refuse streams that don't carry a signed placement spec.
    pub secure: bool,
    /// Flash write granularity; a multiple of the page size that divides the
    /// erase size, and at least one packet payload.
    pub write_chunk_size: usize,
}

/// What a completed session hands back.
#[derive(Debug)]
pub struct SessionReport {
    pub stats: RxStats,
    /// In opaque-image mode, the collected spec blob (if any arrived) for the
    /// caller to validate; always None otherwise.
    pub zdata_spec: Option<PlacementBlob>,
}

/// Parameters latched from the stream's first data packet, plus everything
/// derived from them.
struct Stream {
    nr_blocks: u32,
    block_size: usize,
    coder: BlockCoder,
    zdata: bool,
    table: PartitionTable,
    blocks: Vec<EraseBlock>,
    completed: u32,
}

pub struct Session<'a, N: Nand, S: StopCheck, C: SpecCrypto> {
    nand: &'a mut N,
    stop: &'a S,
    crypto: &'a C,
    secure: bool,
    chunk_size: usize,
    assembler: SpecAssembler,
    /// Parsed placement spec (never populated in opaque-image mode).
    parsed: Option<ParsedSpec>,
    /// Partition map from a partition-map packet.
    wire_map: Option<PartitionMap>,
    stream: Option<Stream>,
    stats: RxStats,
    last_seq: Option<u32>,
    /// Image CRC latched off the first packet that carries a nonzero one.
    total_crc: Option<u32>,
    current_block: Option<u32>,
    rpt: Option<howudoin::Tx>,
}

impl<'a, N: Nand, S: StopCheck, C: SpecCrypto> Session<'a, N, S, C> {
    pub fn new(
        nand: &'a mut N,
        stop: &'a S,
        crypto: &'a C,
        config: SessionConfig,
    ) -> anyhow::Result<Self> {
        let layout = nand.get_layout();
        let chunk = config.write_chunk_size;
        ensure!(chunk >= PKT_SIZE, "write chunk smaller than a packet payload");
        ensure!(
            chunk % layout.bytes_per_page == 0,
            "write chunk not a multiple of the page size"
        );
        // This also guarantees that, once a block holds enough symbols, the
        // flushed chunks cover the erase size exactly and the staging buffer
        // holds only the coded overflow tail.
        ensure!(
            layout.block_size() % chunk == 0,
            "erase size not a multiple of the write chunk"
        );

        Ok(Self {
            nand,
            stop,
            crypto,
            secure: config.secure,
            chunk_size: chunk,
            assembler: SpecAssembler::new(config.secure),
            parsed: None,
            wire_map: None,
            stream: None,
            stats: RxStats::default(),
            last_seq: None,
            total_crc: None,
            current_block: None,
            rpt: None,
        })
    }

    /// Consume packets until the whole image is on flash, then decode, verify
    /// and rewrite it.
    pub fn run<P: PacketSource>(mut self, source: &mut P) -> Result<SessionReport, ProtocolError> {
        let started = std::time::Instant::now();
        loop {
            let pkt = source
                .recv()
                .map_err(ProtocolError::Transport)?
                .ok_or_else(|| {
                    ProtocolError::Transport(anyhow::anyhow!(
                        "packet stream ended before the image completed"
                    ))
                })?;
            let Some((hdr, payload)) = PacketHeader::parse(&pkt) else {
                self.stats.runts += 1;
                continue;
            };

            self.stats.total_pkts += 1;
            // Only forward gaps count; packets may legitimately arrive in any
            // order, so a lower sequence number is not a loss.
            if let Some(last) = self.last_seq {
                if hdr.sequence > last {
                    self.stats.missed += u64::from(hdr.sequence - last - 1);
                }
            }
            self.last_seq = Some(hdr.sequence);

            self.poll_stop(&hdr)?;

            if self.secure && !hdr.has(PLACEMENT_MODE) {
                return Err(ProtocolError::InsecureSender);
            }

            if hdr.has(PLACEMENT_SPEC) {
                self.accept_spec_fragment(&hdr, payload)?;
                continue;
            }

            // Until the spec is whole we don't know where data goes (or, when
            // secure, whether to trust it at all).
            if hdr.has(PLACEMENT_MODE) && !hdr.has(ZDATA_MODE) && !self.assembler.is_complete() {
                self.stats.ignored += 1;
                continue;
            }

            if hdr.has(PARTITION_SPEC) {
                self.accept_partition_map(&hdr, payload)?;
                continue;
            }

            if hdr.has(PARTITION_MODE) && self.wire_map.is_none() && self.parsed.is_none() {
                self.stats.ignored += 1;
                continue;
            }

            if self.accept_data(&hdr, payload)? {
                break;
            }
        }

        if let Some(rpt) = self.rpt.take() {
            rpt.finish();
        }
        info!(
            "all blocks received in {:.1?}; decoding",
            started.elapsed()
        );
        self.finalize()
    }

    /// Stop polling is cheap but not free; do it on block transitions when the
    /// sender groups packets by block, and on a packet-count cadence otherwise.
    fn poll_stop(&mut self, hdr: &PacketHeader) -> Result<(), ProtocolError> {
        let transition = hdr.has(BLOCK_MODE)
            && !hdr.has(PLACEMENT_SPEC)
            && !hdr.has(PARTITION_SPEC)
            && self.current_block != Some(hdr.block_nr);
        if transition {
            self.current_block = Some(hdr.block_nr);
        }
        if (transition || self.stats.total_pkts % 1024 == 0) && self.stop.should_stop() {
            return Err(ProtocolError::Stopped);
        }
        Ok(())
    }

    fn accept_spec_fragment(
        &mut self,
        hdr: &PacketHeader,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if PKT_CRC.checksum(payload) != hdr.this_crc {
            self.stats.bad_crc += 1;
            return Ok(());
        }
        match self.assembler.accept(hdr, payload, self.crypto)? {
            SpecProgress::Ignored => self.stats.duplicates += 1,
            SpecProgress::Collecting => {}
            SpecProgress::Complete => {
                // In opaque-image mode the blob stays raw for the caller;
                // otherwise it is our placement spec text.
                if !hdr.has(ZDATA_MODE) {
                    if let Some(blob) = self.assembler.take_blob() {
                        self.parsed = Some(parse_spec(blob.image())?);
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_partition_map(
        &mut self,
        hdr: &PacketHeader,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.wire_map.is_some() {
            self.stats.duplicates += 1;
            return Ok(());
        }
        if PKT_CRC.checksum(payload) != hdr.this_crc {
            self.stats.bad_crc += 1;
            return Ok(());
        }
        let map = PartitionMap::decode_packet(payload)?;
        info!("partition map: {} partitions", map.real().len());
        self.wire_map = Some(map);
        Ok(())
    }

    /// Latch stream parameters, resolve partitions, and assign every data
    /// block its physical home.
    fn init_stream(&mut self, hdr: &PacketHeader) -> Result<(), ProtocolError> {
        let layout = self.nand.get_layout();
        let block_size = layout.block_size();
        if hdr.block_size as usize != block_size {
            return Err(ProtocolError::EraseSizeMismatch {
                stream: hdr.block_size,
                device: block_size as u32,
            });
        }

        let data_symbols = block_size.div_ceil(PKT_SIZE);
        let coder = BlockCoder::new(data_symbols, hdr.nr_pkts as usize, PKT_SIZE)?;
        let zdata = hdr.has(ZDATA_MODE);

        // The placement spec's map wins over a partition-map packet; with
        // neither, the device is treated as one big partition.
        let map = if let Some(parsed) = &self.parsed {
            parsed.map.clone()
        } else if let Some(map) = &self.wire_map {
            map.clone()
        } else {
            PartitionMap::unpartitioned(hdr.nr_blocks)
        };

        if (self.parsed.is_some() || self.wire_map.is_some()) && map.used_total() < hdr.nr_blocks {
            return Err(ProtocolError::TooFewEblocks {
                listed: map.used_total(),
                streamed: hdr.nr_blocks,
            });
        }
        if let Some(parsed) = &self.parsed {
            if !zdata && (parsed.digests.len() as u32) < hdr.nr_blocks {
                return Err(ProtocolError::TooFewEblocks {
                    listed: parsed.digests.len() as u32,
                    streamed: hdr.nr_blocks,
                });
            }
        }

        let mut table = if zdata {
            PartitionTable::whole_device(layout.blocks)
        } else {
            map_partitions(self.nand, &map)?
        };
        if !table.is_partitioned() {
            let map_flags = map.entries.first().map_or(0, |p| p.flags);
            table.ranges[0].flags = map_flags | (hdr.mode & CLEANMARKERS_MODE);
        }

        let assignments = assign_blocks(self.nand, &mut table, hdr.nr_blocks, zdata)?;
        let blocks = assignments
            .iter()
            .map(|a| EraseBlock::new(a.phys, a.partition, 0))
            .collect();

        info!(
            "receiving {} blocks of {:#x} bytes ({}/{} symbols per block)",
            hdr.nr_blocks, block_size, data_symbols, hdr.nr_pkts
        );
        self.rpt = Some(
            howudoin::new()
                .label("Receiving")
                .set_len(u64::from(hdr.nr_blocks)),
        );

        self.stream = Some(Stream {
            nr_blocks: hdr.nr_blocks,
            block_size,
            coder,
            zdata,
            table,
            blocks,
            completed: 0,
        });
        Ok(())
    }

    /// Fold one data packet in. Returns true once every block is complete.
    fn accept_data(&mut self, hdr: &PacketHeader, payload: &[u8]) -> Result<bool, ProtocolError> {
        if self.stream.is_none() {
            self.init_stream(hdr)?;
        }

        if hdr.total_crc != 0 {
            match self.total_crc {
                None => self.total_crc = Some(hdr.total_crc),
                Some(old) if old != hdr.total_crc => {
                    return Err(ProtocolError::ImageCrcChanged {
                        old,
                        new: hdr.total_crc,
                    })
                }
                _ => {}
            }
        }

        let chunk_size = self.chunk_size;
        let Some(stream) = self.stream.as_mut() else {
            unreachable!()
        };

        if hdr.block_nr >= stream.nr_blocks {
            return Err(ProtocolError::BlockOutOfRange {
                block: hdr.block_nr,
                total: stream.nr_blocks,
            });
        }
        if hdr.pkt_nr as usize >= stream.coder.total_symbols() {
            self.stats.ignored += 1;
            return Ok(false);
        }

        let nr_blocks = stream.nr_blocks;
        let data_symbols = stream.coder.data_symbols();
        let zdata = stream.zdata;
        let Stream {
            table,
            blocks,
            completed,
            ..
        } = stream;
        let eb = &mut blocks[hdr.block_nr as usize];

        if eb.has_index(hdr.pkt_nr) {
            self.stats.duplicates += 1;
            return Ok(false);
        }
        if eb.is_complete(data_symbols) {
            self.stats.ignored += 1;
            return Ok(false);
        }
        if PKT_CRC.checksum(payload) != hdr.this_crc {
            self.stats.bad_crc += 1;
            return Ok(false);
        }

        if eb.indices.is_empty() {
            eb.crc = hdr.block_crc;
        }
        eb.indices.push(hdr.pkt_nr);
        eb.wbuf.extend_from_slice(payload);

        while eb.wbuf.len() >= chunk_size {
            if flush_chunk(self.nand, table, eb, chunk_size, zdata)? {
                // Collection restarted in a fresh block; the staging buffer
                // is empty again.
                break;
            }
        }

        if eb.is_complete(data_symbols) {
            *completed += 1;
            if let Some(rpt) = &self.rpt {
                rpt.inc();
            }
            return Ok(*completed == nr_blocks);
        }
        Ok(false)
    }

    /// The decode pass: read every block back, reconstruct, verify, rewrite.
    fn finalize(mut self) -> Result<SessionReport, ProtocolError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(ProtocolError::Transport(anyhow::anyhow!(
                "no data packets received"
            )));
        };

        if self.secure && !self.assembler.is_complete() {
            return Err(ProtocolError::IncompleteSecuritySpec);
        }

        let rpt = howudoin::new()
            .label("Decoding")
            .set_len(u64::from(stream.nr_blocks));
        let data_symbols = stream.coder.data_symbols();
        let tail = data_symbols * PKT_SIZE - stream.block_size;
        let mut image_crc = PKT_CRC.digest();

        for (block_nr, eb) in stream.blocks.iter_mut().enumerate() {
            if self.stop.should_stop() {
                return Err(ProtocolError::Stopped);
            }

            // Reassemble the arrival-order symbols: the flushed erase block
            // plus the staged overflow tail.
            let mut coded = vec![0u8; data_symbols * PKT_SIZE];
            {
                let block = self
                    .nand
                    .block(eb.phys)
                    .map_err(ProtocolError::Storage)?
                    .ok_or_else(|| {
                        ProtocolError::Storage(anyhow::anyhow!("block {} went bad", eb.phys))
                    })?;
                block
                    .read(0, &mut coded[..stream.block_size])
                    .map_err(ProtocolError::Storage)?;
            }
            coded[stream.block_size..].copy_from_slice(&eb.wbuf[..tail]);

            let symbols: Vec<&[u8]> = coded.chunks(PKT_SIZE).collect();
            let decoded = stream.coder.decode(&symbols, &eb.indices)?;
            let data = &decoded[..stream.block_size];

            self.verify_block(block_nr as u32, data, eb.crc, stream.zdata)?;
            image_crc.update(data);

            self.rewrite_block(&mut stream.table, eb, data, stream.zdata)?;
            rpt.inc();
        }
        rpt.finish();

        if let Some(want) = self.total_crc {
            let got = image_crc.finalize();
            if got != want {
                return Err(ProtocolError::ImageCrcMismatch { want, got });
            }
        }

        if !stream.zdata {
            self.write_cleanmarkers(&stream.table);
        }

        info!(
            "image complete: {} packets, {} duplicates, {} missed",
            self.stats.total_pkts, self.stats.duplicates, self.stats.missed
        );
        Ok(SessionReport {
            stats: self.stats,
            zdata_spec: if stream.zdata {
                self.assembler.take_blob()
            } else {
                None
            },
        })
    }

    /// Decoded blocks are checked against the spec's positional digest when
    /// one was collected; opaque-image and spec-less streams fall back to the
    /// per-block CRC from the packet headers.
    fn verify_block(
        &self,
        block_nr: u32,
        data: &[u8],
        crc: u32,
        zdata: bool,
    ) -> Result<(), ProtocolError> {
        match (&self.parsed, zdata) {
            (Some(parsed), false) => {
                let expected = parsed
                    .digests
                    .get(block_nr as usize)
                    .ok_or(ProtocolError::TooFewEblocks {
                        listed: parsed.digests.len() as u32,
                        streamed: block_nr + 1,
                    })?;
                let got = self
                    .crypto
                    .named_hash(&expected.hash_name, data)
                    .map_err(ProtocolError::Hash)?;
                if got != expected.digest {
                    return Err(ProtocolError::BlockHashMismatch { block: block_nr });
                }
            }
            _ => {
                let got = PKT_CRC.checksum(data);
                if got != crc {
                    return Err(ProtocolError::BlockCrcMismatch {
                        block: block_nr,
                        want: crc,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace a block's arrival-order contents with its decoded contents,
    /// relocating on write failure. Opaque-image placement is fixed, so there
    /// a failure is fatal.
    fn rewrite_block(
        &mut self,
        table: &mut PartitionTable,
        eb: &mut EraseBlock,
        data: &[u8],
        zdata: bool,
    ) -> Result<(), ProtocolError> {
        loop {
            let result = (|| -> anyhow::Result<()> {
                let mut block = self.nand.block(eb.phys)?.context("block went bad")?;
                block.erase()?;
                block.program(0, data)?;
                Ok(())
            })();
            match result {
                Ok(()) => return Ok(()),
                Err(error) if !zdata => {
                    warn!("rewrite failed on block {}: {error:#}; relocating", eb.phys);
                    if let Ok(Some(block)) = self.nand.block(eb.phys) {
                        let _ = block.mark_bad();
                    }
                    let phys = table.take_next_good(self.nand, eb.partition)?;
                    eb.relocate(phys);
                }
                Err(error) => return Err(ProtocolError::Storage(error)),
            }
        }
    }

    /// Erase the unused remainder of every partition that asked for clean
    /// markers, and mark each block. Failures here don't endanger the image,
    /// so they only warn.
    fn write_cleanmarkers(&mut self, table: &PartitionTable) {
        for range in &table.ranges {
            if range.flags & CLEANMARKERS_MODE == 0 {
                continue;
            }
            info!(
                "writing clean markers to blocks {}..{} of {:?}",
                range.next_free, range.end, range.name
            );
            for phys in range.next_free..range.end {
                let result = (|| -> anyhow::Result<()> {
                    let Some(mut block) = self.nand.block(phys)? else {
                        return Ok(());
                    };
                    block.erase()?;
                    block.write_cleanmarker()?;
                    Ok(())
                })();
                if let Err(error) = result {
                    warn!("clean marker on block {phys} failed: {error:#}");
                }
            }
        }
    }
}

/// Write the next full chunk of `eb`'s staging buffer to flash, erasing the
/// block first when this is its first chunk.
///
/// On failure the physical block is marked bad and collection restarts in the
/// owning partition's next good block; returns true in that case. Opaque-image
/// placement is position-significant, so there a failure is fatal instead.
fn flush_chunk<N: Nand>(
    nand: &mut N,
    table: &mut PartitionTable,
    eb: &mut EraseBlock,
    chunk: usize,
    zdata: bool,
) -> Result<bool, ProtocolError> {
    let result = (|| -> anyhow::Result<u32> {
        let mut block = nand.block(eb.phys)?.context("block went bad")?;
        if eb.write_page == 0 {
            block.erase()?;
        }
        block.program(eb.write_page, &eb.wbuf[..chunk])?;
        Ok((chunk / block.page_size()) as u32)
    })();

    match result {
        Ok(pages) => {
            eb.wbuf.drain(..chunk);
            eb.write_page += pages;
            Ok(false)
        }
        Err(error) if !zdata => {
            warn!("write failed on block {}: {error:#}; relocating", eb.phys);
            if let Ok(Some(block)) = nand.block(eb.phys) {
                let _ = block.mark_bad();
            }
            let phys = table.take_next_good(nand, eb.partition)?;
            eb.relocate(phys);
            Ok(true)
        }
        Err(error) => Err(ProtocolError::Storage(error)),
    }
}

#[cfg(test)]
use crate::crypto::Sha2Crypto;
#[cfg(test)]
use crate::nand::{NandLayout, SimNand, CLEANMARKER};
#[cfg(test)]
use sha2::{Digest, Sha256};

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 2,
    bytes_per_page: 2048,
};

#[cfg(test)]
const TEST_BLOCK: usize = 4096;

#[cfg(test)]
const TEST_CONFIG: SessionConfig = SessionConfig {
    secure: false,
    write_chunk_size: 2048,
};

#[cfg(test)]
fn test_image(blocks: usize) -> Vec<u8> {
    (0..blocks * TEST_BLOCK).map(|i| (i % 253) as u8).collect()
}

/// Builds on-wire packets the way a sender would, for feeding to a session.
#[cfg(test)]
struct TestStream {
    image: Vec<u8>,
    coder: BlockCoder,
    nr_pkts: u16,
    mode: u32,
    seq: u32,
}

#[cfg(test)]
impl TestStream {
    fn new(image: Vec<u8>, mode: u32, nr_pkts: u16) -> Self {
        let coder = BlockCoder::new(TEST_BLOCK.div_ceil(PKT_SIZE), nr_pkts as usize, PKT_SIZE)
            .unwrap();
        Self {
            image,
            coder,
            nr_pkts,
            mode,
            seq: 0,
        }
    }

    fn nr_blocks(&self) -> u32 {
        (self.image.len() / TEST_BLOCK) as u32
    }

    fn header(&mut self) -> PacketHeader {
        self.seq += 1;
        PacketHeader {
            mode: self.mode,
            total_crc: PKT_CRC.checksum(&self.image),
            nr_blocks: self.nr_blocks(),
            block_size: TEST_BLOCK as u32,
            sequence: self.seq,
            nr_pkts: self.nr_pkts,
            ..Default::default()
        }
    }

    fn data_packet(&mut self, block_nr: u32, pkt_nr: u16) -> Vec<u8> {
        let block = &self.image[block_nr as usize * TEST_BLOCK..][..TEST_BLOCK];
        let block_crc = PKT_CRC.checksum(block);
        let symbols = self.coder.encode(block).unwrap();
        let payload = &symbols[pkt_nr as usize];

        let mut hdr = self.header();
        hdr.block_crc = block_crc;
        hdr.block_nr = block_nr;
        hdr.pkt_nr = pkt_nr;
        hdr.this_len = PKT_SIZE as u32;
        hdr.this_crc = PKT_CRC.checksum(payload);
        hdr.emit(payload).unwrap()
    }

    fn spec_packet(&mut self, spec: &[u8], fragment: u16) -> Vec<u8> {
        let mut payload = spec[fragment as usize * PKT_SIZE..].to_vec();
        payload.truncate(PKT_SIZE);
        payload.resize(PKT_SIZE, 0);

        let mut hdr = self.header();
        hdr.mode |= PLACEMENT_SPEC;
        hdr.placement_nr_pkts = spec.len().div_ceil(PKT_SIZE).max(1) as u16;
        hdr.placement_pkt_nr = fragment;
        hdr.placement_image_len = spec.len() as u32;
        hdr.this_len = payload.len() as u32;
        hdr.this_crc = PKT_CRC.checksum(&payload);
        hdr.emit(&payload).unwrap()
    }
}

#[cfg(test)]
fn run_session(nand: &mut SimNand, packets: Vec<Vec<u8>>) -> Result<SessionReport, ProtocolError> {
    let session = Session::new(nand, &NeverStop, &Sha2Crypto, TEST_CONFIG).unwrap();
    session.run(&mut packets.into_iter())
}

#[test]
fn test_receive_out_of_order_with_noise() {
    let mut tx = TestStream::new(test_image(2), 0, 6);
    let image = tx.image.clone();

    let mut corrupt = tx.data_packet(1, 2);
    *corrupt.last_mut().unwrap() ^= 0xFF;

    let packets = vec![
        tx.data_packet(0, 5),
        tx.data_packet(1, 1),
        vec![0u8; 10], // runt
        tx.data_packet(0, 0),
        corrupt,
        tx.data_packet(0, 0), // duplicate
        tx.data_packet(1, 4),
        tx.data_packet(0, 2),
        tx.data_packet(1, 3),
        tx.data_packet(0, 1),
        tx.data_packet(1, 0),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = run_session(&mut nand, packets).unwrap();

    assert_eq!(report.stats.duplicates, 1);
    assert_eq!(report.stats.bad_crc, 1);
    assert_eq!(report.stats.runts, 1);
    assert!(report.zdata_spec.is_none());

    assert_eq!(nand.block_content(0).unwrap(), &image[..TEST_BLOCK]);
    assert_eq!(nand.block_content(1).unwrap(), &image[TEST_BLOCK..]);
}

#[test]
fn test_write_failure_relocates() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let image = tx.image.clone();

    // The second packet triggers the first chunk flush, which fails; the
    // block restarts from scratch one block over.
    let packets = vec![
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 2),
        tx.data_packet(0, 3),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_write_failures(0, 1);
    let report = run_session(&mut nand, packets).unwrap();

    assert_eq!(report.stats.duplicates, 0);
    assert!(nand.block(0).unwrap().is_none());
    assert_eq!(nand.block_content(1).unwrap(), image);
}

#[test]
fn test_placement_spec_gates_and_verifies() {
    let mut tx = TestStream::new(test_image(1), PLACEMENT_MODE, 6);
    let image = tx.image.clone();
    let spec = format!(
        "eblock: sha256 {}\n",
        hex::encode(Sha256::digest(&image[..TEST_BLOCK]))
    );

    let packets = vec![
        tx.data_packet(0, 0), // gated: spec not yet complete
        tx.spec_packet(spec.as_bytes(), 0),
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 2),
        tx.data_packet(0, 3),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = run_session(&mut nand, packets).unwrap();
    assert_eq!(report.stats.ignored, 1);
    assert_eq!(nand.block_content(0).unwrap(), image);
}

#[test]
fn test_placement_digest_mismatch_is_fatal() {
    let mut tx = TestStream::new(test_image(1), PLACEMENT_MODE, 6);
    let spec = format!("eblock: sha256 {}\n", hex::encode([0u8; 32]));

    let packets = vec![
        tx.spec_packet(spec.as_bytes(), 0),
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 2),
        tx.data_packet(0, 3),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let err = run_session(&mut nand, packets).unwrap_err();
    assert!(matches!(err, ProtocolError::BlockHashMismatch { block: 0 }));
}

#[test]
fn test_spec_partitions_and_cleanmarkers() {
    let mut tx = TestStream::new(test_image(2), PLACEMENT_MODE, 6);
    let image = tx.image.clone();
    let spec = format!(
        "partitions: boot 2 system -1\n\
         set-partition: boot\n\
         eblock: sha256 {}\n\
         set-partition: system\n\
         cleanmarkers\n\
         eblock: sha256 {}\n",
        hex::encode(Sha256::digest(&image[..TEST_BLOCK])),
        hex::encode(Sha256::digest(&image[TEST_BLOCK..])),
    );

    let packets = vec![
        tx.spec_packet(spec.as_bytes(), 0),
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(1, 5),
        tx.data_packet(1, 2),
        tx.data_packet(0, 2),
        tx.data_packet(1, 1),
        tx.data_packet(0, 3),
        tx.data_packet(1, 0),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    run_session(&mut nand, packets).unwrap();

    // Block 0 fills "boot" (blocks 0..2), block 1 starts "system" at block 2.
    assert_eq!(nand.block_content(0).unwrap(), &image[..TEST_BLOCK]);
    assert_eq!(nand.block_content(2).unwrap(), &image[TEST_BLOCK..]);

    let parts = nand.partitions().unwrap();
    assert_eq!(parts[0].name, "boot");
    assert_eq!(parts[1].start, 2);

    // The unused remainder of "system" got clean markers; "boot" did not.
    let marked = nand.block_content(3).unwrap();
    assert_eq!(&marked[..CLEANMARKER.len()], &CLEANMARKER);
    assert!(nand.block_content(1).unwrap().iter().all(|&x| x == 0xFF));
}

#[test]
fn test_zdata_lands_at_device_end() {
    let mut tx = TestStream::new(test_image(1), PLACEMENT_MODE | ZDATA_MODE, 6);
    let image = tx.image.clone();
    let blob = b"opaque post-processing manifest";

    let packets = vec![
        tx.spec_packet(blob, 0),
        tx.data_packet(0, 3),
        tx.data_packet(0, 0),
        tx.data_packet(0, 5),
        tx.data_packet(0, 1),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = run_session(&mut nand, packets).unwrap();

    assert_eq!(nand.block_content(TEST_LAYOUT.blocks - 1).unwrap(), image);
    let spec = report.zdata_spec.unwrap();
    assert_eq!(spec.image(), blob);
}

#[test]
fn test_zdata_write_failure_is_fatal() {
    let mut tx = TestStream::new(test_image(1), PLACEMENT_MODE | ZDATA_MODE, 6);
    let packets = vec![
        tx.spec_packet(b"opaque manifest", 0),
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 2),
        tx.data_packet(0, 3),
    ];

    // Tail placement is position-significant, so a bad tail block cannot be
    // relocated; the session must fail rather than park the image elsewhere.
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_write_failures(TEST_LAYOUT.blocks - 1, 1);
    let err = run_session(&mut nand, packets).unwrap_err();
    assert!(matches!(err, ProtocolError::Storage(_)));
    assert!(nand.block_content(0).unwrap().iter().all(|&x| x == 0xFF));
}

#[test]
fn test_reordered_sequence_is_not_missed() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let first = tx.data_packet(0, 0); // sequence 1
    let second = tx.data_packet(0, 1); // sequence 2
    let third = tx.data_packet(0, 2); // sequence 3
    let fourth = tx.data_packet(0, 3); // sequence 4

    // Sequence 2 lands before sequence 1; only the 1 -> 3 gap is a loss.
    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = run_session(&mut nand, vec![second, first, third, fourth]).unwrap();
    assert_eq!(report.stats.missed, 1);
}

#[test]
fn test_repeat_after_completion_counts_duplicate() {
    let mut tx = TestStream::new(test_image(2), 0, 6);

    let packets = vec![
        tx.data_packet(0, 0),
        tx.data_packet(0, 1),
        tx.data_packet(0, 2),
        tx.data_packet(0, 3),
        tx.data_packet(0, 0), // block 0 is complete, but this is still a repeat
        tx.data_packet(1, 0),
        tx.data_packet(1, 1),
        tx.data_packet(1, 2),
        tx.data_packet(1, 3),
    ];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = run_session(&mut nand, packets).unwrap();
    assert_eq!(report.stats.duplicates, 1);
    assert_eq!(report.stats.ignored, 0);
}

#[test]
fn test_secure_rejects_plain_sender() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let packets = vec![tx.data_packet(0, 0)];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let session = Session::new(
        &mut nand,
        &NeverStop,
        &Sha2Crypto,
        SessionConfig {
            secure: true,
            write_chunk_size: 2048,
        },
    )
    .unwrap();
    let err = session.run(&mut packets.into_iter()).unwrap_err();
    assert!(matches!(err, ProtocolError::InsecureSender));
}

#[test]
fn test_image_crc_change_is_fatal() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let first = tx.data_packet(0, 0);
    let mut restarted = tx.data_packet(0, 1);
    // Flip a bit of total_crc and fix up the rest of the header.
    let (mut hdr, payload) = PacketHeader::parse(&restarted).unwrap();
    hdr.total_crc ^= 1;
    restarted = hdr.emit(&payload.to_vec()).unwrap();

    let mut nand = SimNand::new(TEST_LAYOUT);
    let err = run_session(&mut nand, vec![first, restarted]).unwrap_err();
    assert!(matches!(err, ProtocolError::ImageCrcChanged { .. }));
}

#[test]
fn test_erase_size_mismatch() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let mut pkt = tx.data_packet(0, 0);
    let (mut hdr, payload) = PacketHeader::parse(&pkt).unwrap();
    hdr.block_size *= 2;
    pkt = hdr.emit(&payload.to_vec()).unwrap();

    let mut nand = SimNand::new(TEST_LAYOUT);
    let err = run_session(&mut nand, vec![pkt]).unwrap_err();
    assert!(matches!(err, ProtocolError::EraseSizeMismatch { .. }));
}

#[test]
fn test_truncated_stream_is_an_error() {
    let mut tx = TestStream::new(test_image(1), 0, 6);
    let packets = vec![tx.data_packet(0, 0), tx.data_packet(0, 1)];

    let mut nand = SimNand::new(TEST_LAYOUT);
    let err = run_session(&mut nand, packets).unwrap_err();
    assert!(matches!(err, ProtocolError::Transport(_)));
}
