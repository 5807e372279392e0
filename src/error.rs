//! The fatal error taxonomy for a receive session.
//!
//! Per-packet problems (bad payload CRC, duplicate symbol, surplus packets for an
//! already-complete block) are not errors; they are discarded and counted in
//! [RxStats](crate::session::RxStats). Everything here aborts the session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A secure receiver saw a packet without `PLACEMENT_MODE` set.
    #[error("secure receiver, non-secure sender")]
    InsecureSender,

    #[error("erase size mismatch: stream says {stream:#x}, device has {device:#x}")]
    EraseSizeMismatch { stream: u32, device: u32 },

    #[error("block number {block} out of range ({total} blocks expected)")]
    BlockOutOfRange { block: u32, total: u32 },

    /// The overall image CRC changed between packets, which means the sender
    /// restarted with different content.
    #[error("image CRC changed mid-stream ({old:#010x} -> {new:#010x})")]
    ImageCrcChanged { old: u32, new: u32 },

    #[error("placement spec parameters changed mid-stream")]
    SpecChanged,

    #[error("placement spec fragment {index} out of range ({count} fragments expected)")]
    SpecFragmentRange { index: u16, count: u16 },

    #[error("placement spec fragment overruns the spec ({offset}+{len} > {total})")]
    SpecFragmentOverrun {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("placement spec signature rejected")]
    BadSignature,

    #[error("security spec incomplete at end of stream")]
    IncompleteSecuritySpec,

    #[error("malformed placement spec: {0}")]
    SpecParse(String),

    #[error("unknown partition {0:?} in set-partition directive")]
    UnknownPartition(String),

    #[error("placement spec lists fewer blocks than the stream carries ({listed} < {streamed})")]
    TooFewEblocks { listed: u32, streamed: u32 },

    #[error("device partition table is incompatible and could not be recreated")]
    PartitionCreateFailed,

    /// Block placement or write-failure relocation walked past the end of the
    /// partition that owns the block.
    #[error("block {block} overruns partition limit {limit}")]
    PartitionExhausted { block: u32, limit: u32 },

    #[error("unusable symbol counts: {nr_pkts} per block on the wire, {needed} needed")]
    BadSymbolCount { nr_pkts: u16, needed: usize },

    #[error("CRC mismatch for block {block}: want {want:#010x} got {got:#010x}")]
    BlockCrcMismatch { block: u32, want: u32, got: u32 },

    #[error("hash mismatch for block {block}")]
    BlockHashMismatch { block: u32 },

    #[error("image CRC mismatch: want {want:#010x} got {got:#010x}")]
    ImageCrcMismatch { want: u32, got: u32 },

    #[error("hash computation failed: {0}")]
    Hash(#[source] anyhow::Error),

    #[error("erasure decode failed: {0}")]
    FecDecode(String),

    #[error("stopped by caller")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}
