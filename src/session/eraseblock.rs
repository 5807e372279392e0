//! Per-block receive state.

/// Everything the receiver tracks about one in-flight data block.
///
/// Accepted symbol payloads are streamed to flash in arrival order (staged
/// through `wbuf` in write-chunk units); only their symbol indices are kept in
/// memory. Decode happens later, against the flash contents.
#[derive(Debug)]
pub struct EraseBlock {
    /// Physical erase block this data block lands in.
    pub phys: u32,
    /// Index of the owning partition in the placement table.
    pub partition: usize,
    /// Next page of the block to program.
    pub write_page: u32,
    /// Symbol index of every accepted payload, in arrival order.
    pub indices: Vec<u16>,
    /// Accepted bytes not yet flushed to flash (always shorter than one
    /// write chunk).
    pub wbuf: Vec<u8>,
    /// Expected CRC of the decoded block, latched off its first packet.
    pub crc: u32,
}

impl EraseBlock {
    pub fn new(phys: u32, partition: usize, crc: u32) -> Self {
        Self {
            phys,
            partition,
            write_page: 0,
            indices: Vec::new(),
            wbuf: Vec::new(),
            crc,
        }
    }

    pub fn has_index(&self, index: u16) -> bool {
        self.indices.contains(&index)
    }

    /// Do we hold enough symbols to decode?
    pub fn is_complete(&self, data_symbols: usize) -> bool {
        self.indices.len() >= data_symbols
    }

    /// Restart collection in a different physical block after a write failure.
    pub fn relocate(&mut self, phys: u32) {
        self.phys = phys;
        self.write_page = 0;
        self.indices.clear();
        self.wbuf.clear();
    }
}

#[test]
fn test_relocate_resets_progress() {
    let mut eb = EraseBlock::new(4, 1, 0xdead_beef);
    eb.indices.extend([3, 0, 7]);
    eb.wbuf.extend_from_slice(&[1, 2, 3]);
    eb.write_page = 9;

    assert!(eb.has_index(7));
    assert!(!eb.has_index(1));
    assert!(eb.is_complete(3));
    assert!(!eb.is_complete(4));

    eb.relocate(11);
    assert_eq!(eb.phys, 11);
    assert_eq!(eb.partition, 1);
    assert_eq!(eb.crc, 0xdead_beef);
    assert!(eb.indices.is_empty());
    assert!(eb.wbuf.is_empty());
    assert_eq!(eb.write_page, 0);
}
