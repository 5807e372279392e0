//! Collection of the placement/security spec from its packet fragments.
//!
//! The sender interleaves spec fragments with the data stream, so fragments
//! arrive repeatedly and in any order. The assembler latches the spec's
//! geometry off the first fragment, fills a bitmap as fragments land, and
//! (for secure receivers) verifies the signature once the image is whole.

pub mod spec;

use tracing::{debug, info};

use crate::crypto::SpecCrypto;
use crate::error::ProtocolError;
use crate::wire::{PacketHeader, PKT_SIZE};

/// The fully-collected spec image plus its detached signature.
#[derive(Debug, Clone)]
pub struct PlacementBlob {
    bytes: Vec<u8>,
    image_len: usize,
}

impl PlacementBlob {
    pub fn image(&self) -> &[u8] {
        &self.bytes[..self.image_len]
    }

    pub fn signature(&self) -> &[u8] {
        &self.bytes[self.image_len..]
    }
}

/// Fragment-arrival bitmap.
struct Bitmap(Vec<u64>);

impl Bitmap {
    fn new(bits: usize) -> Self {
        Self(vec![0; bits.div_ceil(64)])
    }

    /// Set bit `index`; true if it was already set.
    fn test_and_set(&mut self, index: usize) -> bool {
        let word = &mut self.0[index / 64];
        let mask = 1u64 << (index % 64);
        let was = *word & mask != 0;
        *word |= mask;
        was
    }
}

enum State {
    Idle,
    Collecting {
        bytes: Vec<u8>,
        image_len: usize,
        signature_len: usize,
        nr_pkts: u16,
        have: Bitmap,
        remaining: usize,
    },
    /// Blob is taken out by the session; later fragments are ignored.
    Done(Option<PlacementBlob>),
}

/// What one fragment did to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecProgress {
    /// Duplicate fragment, or the spec is already complete.
    Ignored,
    /// Fragment accepted, spec still incomplete.
    Collecting,
    /// This fragment completed the spec.
    Complete,
}

pub struct SpecAssembler {
    secure: bool,
    state: State,
}

impl SpecAssembler {
    pub fn new(secure: bool) -> Self {
        Self {
            secure,
            state: State::Idle,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done(_))
    }

    /// Has any fragment arrived yet?
    pub fn is_started(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn take_blob(&mut self) -> Option<PlacementBlob> {
        match &mut self.state {
            State::Done(blob) => blob.take(),
            _ => None,
        }
    }

    /// Fold one spec fragment in. The payload is the full padded packet
    /// payload; only the in-range prefix is meaningful.
    pub fn accept<C: SpecCrypto>(
        &mut self,
        hdr: &PacketHeader,
        payload: &[u8],
        crypto: &C,
    ) -> Result<SpecProgress, ProtocolError> {
        if let State::Done(_) = self.state {
            return Ok(SpecProgress::Ignored);
        }

        let image_len = hdr.placement_image_len as usize;
        let signature_len = hdr.placement_signature_len as usize;
        let total = image_len + signature_len;

        if let State::Idle = self.state {
            if hdr.placement_nr_pkts as usize != total.div_ceil(PKT_SIZE).max(1) {
                return Err(ProtocolError::SpecChanged);
            }
            debug!(
                fragments = hdr.placement_nr_pkts,
                image_len, signature_len, "collecting placement spec"
            );
            self.state = State::Collecting {
                bytes: vec![0; total],
                image_len,
                signature_len,
                nr_pkts: hdr.placement_nr_pkts,
                have: Bitmap::new(hdr.placement_nr_pkts as usize),
                remaining: hdr.placement_nr_pkts as usize,
            };
        }

        let State::Collecting {
            bytes,
            image_len: latched_image,
            signature_len: latched_signature,
            nr_pkts,
            have,
            remaining,
        } = &mut self.state
        else {
            unreachable!()
        };

        // The spec's geometry must not drift between fragments.
        if image_len != *latched_image
            || signature_len != *latched_signature
            || hdr.placement_nr_pkts != *nr_pkts
        {
            return Err(ProtocolError::SpecChanged);
        }

        if hdr.placement_pkt_nr >= *nr_pkts {
            return Err(ProtocolError::SpecFragmentRange {
                index: hdr.placement_pkt_nr,
                count: *nr_pkts,
            });
        }

        let offset = hdr.placement_pkt_nr as usize * PKT_SIZE;
        let len = usize::min(PKT_SIZE, total.saturating_sub(offset));
        if len == 0 && total != 0 {
            return Err(ProtocolError::SpecFragmentOverrun {
                offset,
                len: PKT_SIZE,
                total,
            });
        }

        if have.test_and_set(hdr.placement_pkt_nr as usize) {
            return Ok(SpecProgress::Ignored);
        }

        bytes[offset..offset + len].copy_from_slice(&payload[..len]);
        *remaining -= 1;
        if *remaining > 0 {
            return Ok(SpecProgress::Collecting);
        }

        let blob = PlacementBlob {
            bytes: std::mem::take(bytes),
            image_len: *latched_image,
        };
        if self.secure && !crypto.verify_signature(blob.image(), blob.signature()) {
            return Err(ProtocolError::BadSignature);
        }
        info!(bytes = blob.bytes.len(), "placement spec complete");
        self.state = State::Done(Some(blob));
        Ok(SpecProgress::Complete)
    }
}

#[cfg(test)]
use crate::crypto::Sha2Crypto;

#[cfg(test)]
fn spec_header(image_len: usize, signature_len: usize) -> PacketHeader {
    PacketHeader {
        placement_nr_pkts: (image_len + signature_len).div_ceil(PKT_SIZE).max(1) as u16,
        placement_image_len: image_len as u32,
        placement_signature_len: signature_len as u32,
        ..Default::default()
    }
}

#[cfg(test)]
fn fragment(image: &[u8], index: usize) -> Vec<u8> {
    let mut payload = image[index * PKT_SIZE..].to_vec();
    payload.truncate(PKT_SIZE);
    payload.resize(PKT_SIZE, 0);
    payload
}

#[test]
fn test_collect_out_of_order_with_duplicates() {
    let image: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    let mut hdr = spec_header(image.len(), 0);
    let mut asm = SpecAssembler::new(false);

    hdr.placement_pkt_nr = 2;
    assert_eq!(
        asm.accept(&hdr, &fragment(&image, 2), &Sha2Crypto).unwrap(),
        SpecProgress::Collecting
    );

    hdr.placement_pkt_nr = 0;
    asm.accept(&hdr, &fragment(&image, 0), &Sha2Crypto).unwrap();

    // A repeat of fragment 0 changes nothing.
    assert_eq!(
        asm.accept(&hdr, &fragment(&image, 0), &Sha2Crypto).unwrap(),
        SpecProgress::Ignored
    );
    assert!(!asm.is_complete());

    hdr.placement_pkt_nr = 1;
    assert_eq!(
        asm.accept(&hdr, &fragment(&image, 1), &Sha2Crypto).unwrap(),
        SpecProgress::Complete
    );

    let blob = asm.take_blob().unwrap();
    assert_eq!(blob.image(), &image[..]);
    assert!(blob.signature().is_empty());
}

#[test]
fn test_geometry_drift_is_fatal() {
    let image = vec![7u8; 100];
    let mut hdr = spec_header(image.len(), 0);
    let mut asm = SpecAssembler::new(false);
    // First fragment is also the whole image here, so use a two-fragment lie.
    hdr.placement_nr_pkts = 2;
    hdr.placement_image_len = (PKT_SIZE + 100) as u32;
    asm.accept(&hdr, &fragment(&vec![7u8; PKT_SIZE + 100], 0), &Sha2Crypto)
        .unwrap();

    hdr.placement_image_len += 1;
    assert!(matches!(
        asm.accept(&hdr, &fragment(&vec![7u8; PKT_SIZE + 101], 0), &Sha2Crypto),
        Err(ProtocolError::SpecChanged)
    ));
}

#[test]
fn test_fragment_out_of_range() {
    let image = vec![1u8; 64];
    let mut hdr = spec_header(image.len(), 0);
    let mut asm = SpecAssembler::new(false);
    hdr.placement_pkt_nr = 5;
    assert!(matches!(
        asm.accept(&hdr, &fragment(&vec![1u8; 6 * PKT_SIZE], 5), &Sha2Crypto),
        Err(ProtocolError::SpecFragmentRange { .. })
    ));
}

#[test]
fn test_secure_needs_valid_signature() {
    // Sha2Crypto rejects all signatures, so a secure collection must fail at
    // the moment of completion.
    let image = vec![3u8; 50];
    let hdr = spec_header(image.len(), 8);
    let mut asm = SpecAssembler::new(true);

    let mut whole = image.clone();
    whole.extend_from_slice(&[0xEE; 8]);
    assert!(matches!(
        asm.accept(&hdr, &fragment(&whole, 0), &Sha2Crypto),
        Err(ProtocolError::BadSignature)
    ));
}
