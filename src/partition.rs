//! Partition handling: the partition map carried in the stream, mapping it
//! onto the device's real partitions, and handing out physical erase blocks.
//!
//! Index 0 of a partition map is always the whole-device pseudo-partition;
//! real partitions follow in device order. Data blocks are numbered
//! consecutively across the whole stream, so each real partition covers a
//! contiguous range of them, bounded by a cumulative block limit.

use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::nand::Nand;

pub const MAX_PARTITIONS: usize = 16;
pub const MAX_PARTITION_NAME: usize = 32;

/// Version of the binary partition-map payload.
pub const PARTITION_MAP_VERSION: u32 = 1;

/// One entry of the streamed partition map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    /// Partition size in erase blocks. `u32::MAX` means "rest of the device"
    /// and is only meaningful for the last entry.
    pub total_eblocks: u32,
    /// How many of those blocks the stream actually carries data for.
    pub used_eblocks: u32,
    pub flags: u32,
}

/// The streamed partition map: entry 0 is the whole device, the rest are the
/// real partitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionMap {
    pub entries: Vec<PartitionSpec>,
}

impl PartitionMap {
    /// A map describing an unpartitioned stream of `used` data blocks.
    pub fn unpartitioned(used: u32) -> Self {
        Self {
            entries: vec![PartitionSpec {
                name: String::new(),
                total_eblocks: u32::MAX,
                used_eblocks: used,
                flags: 0,
            }],
        }
    }

    /// Real partitions only (entry 0 excluded).
    pub fn real(&self) -> &[PartitionSpec] {
        self.entries.get(1..).unwrap_or(&[])
    }

    pub fn is_partitioned(&self) -> bool {
        self.entries.len() > 1
    }

    /// Sum of `used_eblocks` over the partitions data is placed into.
    pub fn used_total(&self) -> u32 {
        if self.is_partitioned() {
            self.real().iter().map(|p| p.used_eblocks).sum()
        } else {
            self.entries.first().map_or(0, |p| p.used_eblocks)
        }
    }

    /// Decode the payload of a partition-map packet.
    ///
    /// Layout: version and real-partition count as big-endian `u32`s, then
    /// count+1 records of 32 name bytes (NUL padded) and three `u32`s
    /// (total, used, flags).
    pub fn decode_packet(payload: &[u8]) -> Result<Self, ProtocolError> {
        let word = |ofs: usize| -> Result<u32, ProtocolError> {
            payload
                .get(ofs..ofs + 4)
                .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                .ok_or_else(|| ProtocolError::SpecParse("partition map truncated".into()))
        };

        let version = word(0)?;
        if version != PARTITION_MAP_VERSION {
            return Err(ProtocolError::SpecParse(format!(
                "partition map version {version} not understood"
            )));
        }
        let nr_partitions = word(4)? as usize;
        if nr_partitions > MAX_PARTITIONS {
            return Err(ProtocolError::SpecParse(format!(
                "{nr_partitions} partitions (limit {MAX_PARTITIONS})"
            )));
        }

        const RECORD: usize = MAX_PARTITION_NAME + 12;
        let mut entries = Vec::with_capacity(nr_partitions + 1);
        for i in 0..=nr_partitions {
            let base = 8 + i * RECORD;
            let name = payload
                .get(base..base + MAX_PARTITION_NAME)
                .ok_or_else(|| ProtocolError::SpecParse("partition map truncated".into()))?;
            let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            let name = String::from_utf8_lossy(&name[..name_len]).into_owned();

            entries.push(PartitionSpec {
                name,
                total_eblocks: word(base + MAX_PARTITION_NAME)?,
                used_eblocks: word(base + MAX_PARTITION_NAME + 4)?,
                flags: word(base + MAX_PARTITION_NAME + 8)?,
            });
        }

        Ok(Self { entries })
    }

    /// Encode this map as a partition-map packet payload.
    pub fn encode_packet(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(!self.entries.is_empty(), "partition map has no entries");
        anyhow::ensure!(
            self.real().len() <= MAX_PARTITIONS,
            "too many partitions to encode"
        );

        let mut out = Vec::new();
        out.extend_from_slice(&PARTITION_MAP_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.real().len() as u32).to_be_bytes());
        for entry in &self.entries {
            anyhow::ensure!(
                entry.name.len() <= MAX_PARTITION_NAME,
                "partition name {:?} too long",
                entry.name
            );
            let mut name = [0u8; MAX_PARTITION_NAME];
            name[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&name);
            out.extend_from_slice(&entry.total_eblocks.to_be_bytes());
            out.extend_from_slice(&entry.used_eblocks.to_be_bytes());
            out.extend_from_slice(&entry.flags.to_be_bytes());
        }
        Ok(out)
    }
}

/// One partition's slice of the device, resolved against real hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub name: String,
    /// First physical erase block.
    pub start: u32,
    /// One past the last physical erase block.
    pub end: u32,
    /// Next unassigned physical block; advances as blocks are handed out.
    pub next_free: u32,
    pub flags: u32,
    /// Data blocks below this number belong to this or an earlier partition
    /// (cumulative over `used_eblocks`).
    pub block_limit: u32,
}

/// The resolved placement table. Entry 0 is always the whole device; when the
/// table is partitioned, placement never draws from entry 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub ranges: Vec<PartitionRange>,
}

impl PartitionTable {
    /// A table treating the device as one big partition.
    pub fn whole_device(blocks: u32) -> Self {
        Self {
            ranges: vec![PartitionRange {
                name: String::new(),
                start: 0,
                end: blocks,
                next_free: 0,
                flags: 0,
                block_limit: blocks,
            }],
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.ranges.len() > 1
    }

    /// Highest data-block number this table can place, exclusive.
    pub fn last_limit(&self) -> u32 {
        self.ranges.last().map_or(0, |r| r.block_limit)
    }

    /// Index of the partition owning data block `block_nr`.
    pub fn owner_of(&self, block_nr: u32) -> Result<usize, ProtocolError> {
        self.ranges
            .iter()
            .position(|r| block_nr < r.block_limit)
            .ok_or(ProtocolError::BlockOutOfRange {
                block: block_nr,
                total: self.last_limit(),
            })
    }

    /// Hand out the next good physical block of partition `index`, advancing
    /// its cursor past any bad blocks.
    pub fn take_next_good<N: Nand>(
        &mut self,
        nand: &mut N,
        index: usize,
    ) -> Result<u32, ProtocolError> {
        let range = &mut self.ranges[index];
        let mut phys = range.next_free;
        loop {
            if phys >= range.end {
                return Err(ProtocolError::PartitionExhausted {
                    block: phys,
                    limit: range.end,
                });
            }
            match nand.block(phys).map_err(ProtocolError::Storage)? {
                Some(_) => break,
                None => {
                    debug!(block = phys, "skipping bad block");
                    phys += 1;
                }
            }
        }
        range.next_free = phys + 1;
        Ok(phys)
    }
}

/// Resolve the streamed partition map against the device.
///
/// The device layout is compatible when every real partition in the map exists
/// by name, in order, with room for the data it carries. Otherwise the device
/// is repartitioned to the map's layout and checked again.
pub fn map_partitions<N: Nand>(
    nand: &mut N,
    map: &PartitionMap,
) -> Result<PartitionTable, ProtocolError> {
    let blocks = nand.get_layout().blocks;
    if !map.is_partitioned() {
        return Ok(PartitionTable::whole_device(blocks));
    }

    if let Some(table) = try_resolve(nand, map)? {
        return Ok(table);
    }

    info!("device partition table is incompatible, recreating");
    let layout: Vec<(String, u32)> = map
        .real()
        .iter()
        .map(|p| (p.name.clone(), p.total_eblocks))
        .collect();
    nand.repartition(&layout)
        .map_err(|_| ProtocolError::PartitionCreateFailed)?;

    try_resolve(nand, map)?.ok_or(ProtocolError::PartitionCreateFailed)
}

/// Build a placement table from the device's current partitions, or None if
/// they don't fit the map.
fn try_resolve<N: Nand>(
    nand: &mut N,
    map: &PartitionMap,
) -> Result<Option<PartitionTable>, ProtocolError> {
    let existing = nand.partitions().map_err(ProtocolError::Storage)?;
    let blocks = nand.get_layout().blocks;

    let mut ranges = vec![PartitionRange {
        name: String::new(),
        start: 0,
        end: blocks,
        next_free: 0,
        flags: 0,
        // Placement skips the whole-device entry when real partitions exist.
        block_limit: 0,
    }];

    let mut limit = 0u32;
    for spec in map.real() {
        let Some(found) = existing.iter().find(|p| p.name == spec.name) else {
            return Ok(None);
        };
        if found.blocks < spec.used_eblocks {
            return Ok(None);
        }
        limit += spec.used_eblocks;
        ranges.push(PartitionRange {
            name: spec.name.clone(),
            start: found.start,
            end: found.start + found.blocks,
            next_free: found.start,
            flags: spec.flags,
            block_limit: limit,
        });
    }

    Ok(Some(PartitionTable { ranges }))
}

/// Where one data block goes on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAssignment {
    /// Physical erase block.
    pub phys: u32,
    /// Index into [PartitionTable::ranges] of the owning partition.
    pub partition: usize,
}

/// Assign a physical erase block to every data block up front.
///
/// Normal streams fill each partition from its start, skipping bad blocks. An
/// opaque-image stream instead lands at the very end of the device, with no
/// bad-block skipping (the consumer of such an image deals with placement
/// itself).
pub fn assign_blocks<N: Nand>(
    nand: &mut N,
    table: &mut PartitionTable,
    nr_blocks: u32,
    zdata: bool,
) -> Result<Vec<BlockAssignment>, ProtocolError> {
    let device_blocks = nand.get_layout().blocks;

    if zdata {
        let start = device_blocks
            .checked_sub(nr_blocks)
            .ok_or(ProtocolError::BlockOutOfRange {
                block: nr_blocks,
                total: device_blocks,
            })?;
        return Ok((0..nr_blocks)
            .map(|i| BlockAssignment {
                phys: start + i,
                partition: 0,
            })
            .collect());
    }

    let mut assignments = Vec::with_capacity(nr_blocks as usize);
    for block_nr in 0..nr_blocks {
        let partition = table.owner_of(block_nr)?;
        let phys = table.take_next_good(nand, partition)?;
        assignments.push(BlockAssignment { phys, partition });
    }
    Ok(assignments)
}

#[cfg(test)]
use crate::nand::{NandLayout, SimNand};

#[cfg(test)]
fn two_partition_map() -> PartitionMap {
    PartitionMap {
        entries: vec![
            PartitionSpec {
                name: String::new(),
                total_eblocks: 0x110,
                used_eblocks: 0,
                flags: 0,
            },
            PartitionSpec {
                name: "boot".into(),
                total_eblocks: 0x10,
                used_eblocks: 0x10,
                flags: 0,
            },
            PartitionSpec {
                name: "system".into(),
                total_eblocks: 0x100,
                used_eblocks: 0x40,
                flags: 0x100,
            },
        ],
    }
}

#[test]
fn test_map_packet_round_trip() {
    let map = two_partition_map();
    let payload = map.encode_packet().unwrap();
    assert_eq!(payload.len(), 8 + 3 * 44);
    assert_eq!(PartitionMap::decode_packet(&payload).unwrap(), map);
}

#[test]
fn test_map_packet_rejects_garbage() {
    assert!(PartitionMap::decode_packet(&[]).is_err());

    let mut payload = two_partition_map().encode_packet().unwrap();
    payload[3] = 9; // version
    assert!(PartitionMap::decode_packet(&payload).is_err());

    let payload = two_partition_map().encode_packet().unwrap();
    assert!(PartitionMap::decode_packet(&payload[..payload.len() - 1]).is_err());
}

#[test]
fn test_cumulative_limits() {
    let layout = NandLayout {
        blocks: 0x110,
        pages_per_block: 4,
        bytes_per_page: 64,
    };
    let mut nand = SimNand::new(layout);
    nand.repartition(&[("boot".into(), 0x10), ("system".into(), u32::MAX)])
        .unwrap();

    let table = map_partitions(&mut nand, &two_partition_map()).unwrap();
    assert!(table.is_partitioned());
    assert_eq!(table.ranges[1].block_limit, 0x10);
    assert_eq!(table.ranges[2].block_limit, 0x50);
    assert_eq!(table.last_limit(), 0x50);

    // Data block 0x10 is the first block of "system", physically at 0x10.
    assert_eq!(table.owner_of(0x0f).unwrap(), 1);
    assert_eq!(table.owner_of(0x10).unwrap(), 2);
    assert!(table.owner_of(0x50).is_err());
}

#[test]
fn test_map_partitions_recreates_layout() {
    let layout = NandLayout {
        blocks: 0x110,
        pages_per_block: 4,
        bytes_per_page: 64,
    };
    let mut nand = SimNand::new(layout);

    // No partitions yet; mapping repartitions the device to match.
    let table = map_partitions(&mut nand, &two_partition_map()).unwrap();
    assert_eq!(table.ranges[2].start, 0x10);
    assert_eq!(table.ranges[2].end, 0x110);

    let parts = nand.partitions().unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name, "boot");
}

#[test]
fn test_assign_blocks_skips_bad() {
    let layout = NandLayout {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 64,
    };
    let mut nand = SimNand::new(layout);
    nand.set_bad(5);

    let mut table = PartitionTable::whole_device(layout.blocks);
    let assignments = assign_blocks(&mut nand, &mut table, 8, false).unwrap();

    let phys: Vec<u32> = assignments.iter().map(|a| a.phys).collect();
    assert_eq!(phys, [0, 1, 2, 3, 4, 6, 7, 8]);
    assert_eq!(table.ranges[0].next_free, 9);
}

#[test]
fn test_assign_blocks_partition_exhausted() {
    let layout = NandLayout {
        blocks: 8,
        pages_per_block: 4,
        bytes_per_page: 64,
    };
    let mut nand = SimNand::new(layout);
    for b in 4..8 {
        nand.set_bad(b);
    }

    let mut table = PartitionTable::whole_device(layout.blocks);
    let err = assign_blocks(&mut nand, &mut table, 6, false).unwrap_err();
    assert!(matches!(err, ProtocolError::PartitionExhausted { .. }));
}

#[test]
fn test_assign_blocks_zdata_tail() {
    let layout = NandLayout {
        blocks: 32,
        pages_per_block: 4,
        bytes_per_page: 64,
    };
    let mut nand = SimNand::new(layout);
    // Bad blocks are not skipped in the opaque-image layout.
    nand.set_bad(30);

    let mut table = PartitionTable::whole_device(layout.blocks);
    let assignments = assign_blocks(&mut nand, &mut table, 4, true).unwrap();
    let phys: Vec<u32> = assignments.iter().map(|a| a.phys).collect();
    assert_eq!(phys, [28, 29, 30, 31]);
}
