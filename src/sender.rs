//! The image sender: erasure-codes an image and repeats it over a
//! [PacketSink] until stopped.
//!
//! The sender is stateless with respect to receivers; it just cycles passes.
//! Receivers that missed packets in one pass pick them up in the next. The
//! whole-image CRC is only known after a full pass over the image, so pass
//! one advertises it as zero and later passes carry the real value.

use anyhow::{bail, ensure};
use tracing::{info, warn};

use crate::fec::BlockCoder;
use crate::partition::PartitionMap;
use crate::transport::PacketSink;
use crate::wire::{
    PacketHeader, BLOCK_MODE, CLEANMARKERS_MODE, PARTITION_MODE, PARTITION_SPEC,
    PKT_CRC, PKT_SIZE, PLACEMENT_INTERVAL, PLACEMENT_MODE, PLACEMENT_SPEC, ZDATA_MODE,
};

/// Give up after this many back-to-back send failures.
const MAX_SEND_ERRORS: u32 = 10;

#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Erase-block size of the target devices.
    pub block_size: usize,
    /// Extra symbols per block, as a percentage of the data symbols (0..=99).
    pub redundancy: u32,
    /// Opaque-image mode: receivers park the blocks at the end of the device.
    pub zdata: bool,
    /// Ask receivers to clean-mark the unused rest of the device (only
    /// meaningful without a placement spec; specs carry their own flags).
    pub cleanmarkers: bool,
    /// Emit all symbols of a block back-to-back rather than round-robin.
    pub block_grouped: bool,
}

pub struct ImageSender {
    image: Vec<u8>,
    /// Placement spec text (or opaque blob) plus detached signature.
    spec: Option<(Vec<u8>, Vec<u8>)>,
    map: Option<PartitionMap>,
    coder: BlockCoder,
    block_size: usize,
    nr_blocks: u32,
    mode: u32,
    zdata: bool,
    /// None until one full pass has been sent.
    total_crc: Option<u32>,
    sequence: u32,
    send_errors: u32,
}

impl ImageSender {
    pub fn new(mut image: Vec<u8>, opts: &SenderOptions) -> anyhow::Result<Self> {
        ensure!(opts.redundancy <= 99, "redundancy must be 0..=99 percent");
        ensure!(!image.is_empty(), "empty image");

        if opts.zdata {
            // Opaque images may end mid-block; receivers never interpret the
            // padding, so plain spaces keep it visibly inert.
            let padded = image.len().div_ceil(opts.block_size) * opts.block_size;
            image.resize(padded, b' ');
        } else {
            ensure!(
                image.len() % opts.block_size == 0,
                "image is not a whole number of {:#x}-byte blocks",
                opts.block_size
            );
        }

        let data_symbols = opts.block_size.div_ceil(PKT_SIZE);
        let total_symbols = data_symbols * (100 + opts.redundancy as usize) / 100;
        let coder = BlockCoder::new(data_symbols, total_symbols, PKT_SIZE)?;

        let mut mode = 0;
        if opts.zdata {
            mode |= ZDATA_MODE | PLACEMENT_MODE;
        }
        if opts.cleanmarkers {
            mode |= CLEANMARKERS_MODE;
        }
        if opts.block_grouped {
            mode |= BLOCK_MODE;
        }

        Ok(Self {
            nr_blocks: (image.len() / opts.block_size) as u32,
            image,
            spec: None,
            map: None,
            coder,
            block_size: opts.block_size,
            mode,
            zdata: opts.zdata,
            total_crc: None,
            sequence: 0,
            send_errors: 0,
        })
    }

    /// Attach a placement spec (or, in opaque-image mode, the blob receivers
    /// hand to their caller) and its signature.
    pub fn with_spec(mut self, image: Vec<u8>, signature: Vec<u8>) -> Self {
        self.mode |= PLACEMENT_MODE;
        self.spec = Some((image, signature));
        self
    }

    /// Attach a partition map, to be sent as partition-map packets.
    pub fn with_map(mut self, map: PartitionMap) -> Self {
        self.mode |= PARTITION_MODE;
        self.map = Some(map);
        self
    }

    fn header(&mut self) -> PacketHeader {
        self.sequence = self.sequence.wrapping_add(1);
        PacketHeader {
            mode: self.mode,
            total_crc: self.total_crc.unwrap_or(0),
            nr_blocks: self.nr_blocks,
            block_size: self.block_size as u32,
            sequence: self.sequence,
            nr_pkts: self.coder.total_symbols() as u16,
            ..Default::default()
        }
    }

    fn post<K: PacketSink>(&mut self, sink: &mut K, pkt: &[u8]) -> anyhow::Result<()> {
        match sink.send(pkt) {
            Ok(()) => {
                self.send_errors = 0;
                Ok(())
            }
            Err(error) => {
                self.send_errors += 1;
                warn!("send failed ({} in a row): {error:#}", self.send_errors);
                if self.send_errors >= MAX_SEND_ERRORS {
                    bail!("giving up after {MAX_SEND_ERRORS} consecutive send errors");
                }
                Ok(())
            }
        }
    }

    fn send_spec_fragment<K: PacketSink>(
        &mut self,
        sink: &mut K,
        fragment: u16,
    ) -> anyhow::Result<()> {
        let Some((spec, signature)) = &self.spec else {
            return Ok(());
        };
        let total = spec.len() + signature.len();
        let nr_fragments = total.div_ceil(PKT_SIZE).max(1);

        let mut payload = Vec::with_capacity(PKT_SIZE);
        let offset = fragment as usize * PKT_SIZE;
        for i in offset..usize::min(offset + PKT_SIZE, total) {
            payload.push(if i < spec.len() {
                spec[i]
            } else {
                signature[i - spec.len()]
            });
        }
        let this_len = payload.len();
        payload.resize(PKT_SIZE, 0);

        let spec_len = spec.len();
        let signature_len = signature.len();
        let mut hdr = self.header();
        hdr.mode |= PLACEMENT_SPEC;
        hdr.placement_nr_pkts = nr_fragments as u16;
        hdr.placement_pkt_nr = fragment;
        hdr.placement_image_len = spec_len as u32;
        hdr.placement_signature_len = signature_len as u32;
        hdr.this_len = this_len as u32;
        hdr.this_crc = PKT_CRC.checksum(&payload);

        let pkt = hdr.emit(&payload)?;
        self.post(sink, &pkt)
    }

    fn send_map<K: PacketSink>(&mut self, sink: &mut K) -> anyhow::Result<()> {
        let Some(map) = &self.map else {
            return Ok(());
        };
        let mut payload = map.encode_packet()?;
        let this_len = payload.len();
        payload.resize(PKT_SIZE, 0);

        let mut hdr = self.header();
        hdr.mode |= PARTITION_SPEC;
        hdr.this_len = this_len as u32;
        hdr.this_crc = PKT_CRC.checksum(&payload);

        let pkt = hdr.emit(&payload)?;
        self.post(sink, &pkt)
    }

    fn spec_fragment_count(&self) -> u16 {
        self.spec
            .as_ref()
            .map(|(s, sig)| (s.len() + sig.len()).div_ceil(PKT_SIZE).max(1) as u16)
            .unwrap_or(0)
    }

    /// How many data packets between spec fragments. Opaque-image receivers
    /// may join at any point and want the spec early, so it is repeated at
    /// least three times per pass there.
    fn spec_interval(&self) -> u64 {
        let fragments = u64::from(self.spec_fragment_count()).max(1);
        let data_pkts = u64::from(self.nr_blocks) * self.coder.total_symbols() as u64;
        if self.zdata {
            (data_pkts / (3 * fragments)).clamp(1, u64::from(PLACEMENT_INTERVAL))
        } else {
            u64::from(PLACEMENT_INTERVAL)
        }
    }

    /// Send the whole image once: metadata up front, then every symbol of
    /// every block, with spec fragments woven in.
    pub fn send_pass<K: PacketSink>(&mut self, sink: &mut K) -> anyhow::Result<()> {
        self.send_map(sink)?;
        for fragment in 0..self.spec_fragment_count() {
            self.send_spec_fragment(sink, fragment)?;
        }

        let interval = self.spec_interval();
        let spec_fragments = self.spec_fragment_count();
        let mut sent: u64 = 0;
        let mut next_fragment: u16 = 0;
        let mut image_crc = PKT_CRC.digest();

        for block_nr in 0..self.nr_blocks {
            let block = &self.image[block_nr as usize * self.block_size..][..self.block_size];
            let block_crc = PKT_CRC.checksum(block);
            image_crc.update(block);
            let symbols = self.coder.encode(block)?;

            for (pkt_nr, payload) in symbols.iter().enumerate() {
                let mut hdr = self.header();
                hdr.block_crc = block_crc;
                hdr.block_nr = block_nr;
                hdr.pkt_nr = pkt_nr as u16;
                hdr.this_len = PKT_SIZE as u32;
                hdr.this_crc = PKT_CRC.checksum(payload);
                let pkt = hdr.emit(payload)?;
                self.post(sink, &pkt)?;

                sent += 1;
                if spec_fragments > 0 && sent % interval == 0 {
                    self.send_spec_fragment(sink, next_fragment)?;
                    next_fragment = (next_fragment + 1) % spec_fragments;
                    self.send_map(sink)?;
                }
            }
        }

        if self.total_crc.is_none() {
            self.total_crc = Some(image_crc.finalize());
        }
        Ok(())
    }

    /// Send `passes` passes back to back.
    pub fn run<K: PacketSink>(&mut self, sink: &mut K, passes: u32) -> anyhow::Result<()> {
        info!(
            "sending {} blocks, {}/{} symbols per block",
            self.nr_blocks,
            self.coder.data_symbols(),
            self.coder.total_symbols()
        );
        for pass in 0..passes {
            info!("pass {} of {passes}", pass + 1);
            self.send_pass(sink)?;
        }
        Ok(())
    }
}

#[cfg(test)]
use crate::crypto::Sha2Crypto;
#[cfg(test)]
use crate::nand::{NandLayout, SimNand};
#[cfg(test)]
use crate::session::{NeverStop, Session, SessionConfig};
#[cfg(test)]
use sha2::{Digest, Sha256};

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 2,
    bytes_per_page: 2048,
};

#[cfg(test)]
fn receive(nand: &mut SimNand, packets: Vec<Vec<u8>>) -> crate::session::SessionReport {
    let session = Session::new(
        nand,
        &NeverStop,
        &Sha2Crypto,
        SessionConfig {
            secure: false,
            write_chunk_size: 2048,
        },
    )
    .unwrap();
    session.run(&mut packets.into_iter()).unwrap()
}

#[cfg(test)]
fn test_options() -> SenderOptions {
    SenderOptions {
        block_size: 4096,
        redundancy: 50,
        zdata: false,
        cleanmarkers: false,
        block_grouped: false,
    }
}

#[test]
fn test_round_trip_plain() {
    let image: Vec<u8> = (0..2 * 4096).map(|i| (i % 241) as u8).collect();
    let mut sender = ImageSender::new(image.clone(), &test_options()).unwrap();

    let mut packets: Vec<Vec<u8>> = Vec::new();
    sender.run(&mut packets, 1).unwrap();

    let mut nand = SimNand::new(TEST_LAYOUT);
    receive(&mut nand, packets);
    assert_eq!(nand.block_content(0).unwrap(), &image[..4096]);
    assert_eq!(nand.block_content(1).unwrap(), &image[4096..]);
}

#[test]
fn test_round_trip_with_spec() {
    let image: Vec<u8> = (0..4096).map(|i| (i % 239) as u8).collect();
    let spec = format!("eblock: sha256 {}\n", hex::encode(Sha256::digest(&image)));

    let mut sender = ImageSender::new(image.clone(), &test_options())
        .unwrap()
        .with_spec(spec.into_bytes(), Vec::new());

    let mut packets: Vec<Vec<u8>> = Vec::new();
    sender.run(&mut packets, 1).unwrap();

    let mut nand = SimNand::new(TEST_LAYOUT);
    receive(&mut nand, packets);
    assert_eq!(nand.block_content(0).unwrap(), image);
}

#[test]
fn test_second_pass_carries_image_crc() {
    let image: Vec<u8> = vec![0x42; 4096];
    let mut sender = ImageSender::new(image.clone(), &test_options()).unwrap();

    let mut first: Vec<Vec<u8>> = Vec::new();
    sender.send_pass(&mut first).unwrap();
    let mut second: Vec<Vec<u8>> = Vec::new();
    sender.send_pass(&mut second).unwrap();

    let (hdr, _) = PacketHeader::parse(&first[0]).unwrap();
    assert_eq!(hdr.total_crc, 0);
    let (hdr, _) = PacketHeader::parse(&second[0]).unwrap();
    assert_eq!(hdr.total_crc, PKT_CRC.checksum(&image));

    // A receiver fed the second pass verifies that CRC end to end.
    let mut nand = SimNand::new(TEST_LAYOUT);
    receive(&mut nand, second);
    assert_eq!(nand.block_content(0).unwrap(), image);
}

#[test]
fn test_zdata_pads_short_tail() {
    let mut opts = test_options();
    opts.zdata = true;
    let image = vec![0x17u8; 5000]; // not block-aligned

    let mut sender = ImageSender::new(image.clone(), &opts)
        .unwrap()
        .with_spec(b"manifest".to_vec(), Vec::new());

    let mut packets: Vec<Vec<u8>> = Vec::new();
    sender.send_pass(&mut packets).unwrap();

    let mut nand = SimNand::new(TEST_LAYOUT);
    let report = receive(&mut nand, packets);
    assert_eq!(report.zdata_spec.unwrap().image(), b"manifest");

    // Two blocks at the device tail: the image, then space padding.
    let first = nand.block_content(6).unwrap();
    assert_eq!(&first, &image[..4096]);
    let second = nand.block_content(7).unwrap();
    assert_eq!(&second[..904], &image[4096..]);
    assert!(second[904..].iter().all(|&x| x == b' '));
}

#[test]
fn test_rejects_bad_redundancy() {
    let opts = SenderOptions {
        redundancy: 100,
        ..test_options()
    };
    assert!(ImageSender::new(vec![0; 4096], &opts).is_err());
}

#[test]
fn test_rejects_ragged_image() {
    assert!(ImageSender::new(vec![0; 5000], &test_options()).is_err());
}
