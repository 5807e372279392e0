//! Parser for the placement-spec text.
//!
//! The spec image is line-oriented ASCII. Each line is a directive:
//!
//! ```text
//! partitions: boot 10 system -1
//! set-partition: boot
//! cleanmarkers
//! eblock: sha256 9f86d081884c7d65...
//! ```
//!
//! `eblock:` lines are positional; the Nth one carries the digest of data
//! block N. Partition sizes are hex erase-block counts, `-1` meaning "rest of
//! the device". Directives this parser does not know are skipped, so older
//! receivers tolerate newer senders.

use crate::error::ProtocolError;
use crate::partition::{PartitionMap, PartitionSpec, MAX_PARTITIONS, MAX_PARTITION_NAME};
use crate::wire::CLEANMARKERS_MODE;

/// Expected digest of one data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EblockDigest {
    pub hash_name: String,
    pub digest: Vec<u8>,
}

/// Everything a placement-spec image tells the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSpec {
    pub map: PartitionMap,
    pub digests: Vec<EblockDigest>,
}

/// Parse a hex block count, where a leading `-` wraps around (so `-1` is
/// `u32::MAX`, "rest of the device").
fn parse_size(token: &str) -> Result<u32, ProtocolError> {
    let (negate, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = u32::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::SpecParse(format!("bad block count {token:?}")))?;
    Ok(if negate { value.wrapping_neg() } else { value })
}

pub fn parse_spec(image: &[u8]) -> Result<ParsedSpec, ProtocolError> {
    let text = std::str::from_utf8(image)
        .map_err(|_| ProtocolError::SpecParse("spec is not valid UTF-8".into()))?;

    let mut map = PartitionMap::unpartitioned(0);
    let mut digests = Vec::new();
    let mut current = 0usize;

    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(directive) = tokens.next() else {
            continue;
        };

        match directive {
            "eblock:" => {
                let hash_name = tokens.next().ok_or_else(|| {
                    ProtocolError::SpecParse("eblock: missing hash name".into())
                })?;
                let digest = tokens.next().ok_or_else(|| {
                    ProtocolError::SpecParse("eblock: missing digest".into())
                })?;
                let digest = hex::decode(digest)
                    .map_err(|_| ProtocolError::SpecParse(format!("bad digest {digest:?}")))?;
                digests.push(EblockDigest {
                    hash_name: hash_name.to_owned(),
                    digest,
                });
                map.entries[0].used_eblocks += 1;
                if current != 0 {
                    map.entries[current].used_eblocks += 1;
                }
            }
            "partitions:" => {
                let mut tokens = tokens.peekable();
                while let Some(name) = tokens.next() {
                    let size = tokens.next().ok_or_else(|| {
                        ProtocolError::SpecParse(format!("partition {name:?} has no size"))
                    })?;
                    if name.len() > MAX_PARTITION_NAME {
                        return Err(ProtocolError::SpecParse(format!(
                            "partition name {name:?} too long"
                        )));
                    }
                    if map.real().len() >= MAX_PARTITIONS {
                        return Err(ProtocolError::SpecParse(format!(
                            "more than {MAX_PARTITIONS} partitions"
                        )));
                    }
                    map.entries.push(PartitionSpec {
                        name: name.to_owned(),
                        total_eblocks: parse_size(size)?,
                        used_eblocks: 0,
                        flags: 0,
                    });
                }
            }
            "set-partition:" => {
                let name = tokens.next().ok_or_else(|| {
                    ProtocolError::SpecParse("set-partition: missing name".into())
                })?;
                current = map
                    .entries
                    .iter()
                    .skip(1)
                    .position(|p| p.name == name)
                    .map(|i| i + 1)
                    .ok_or_else(|| ProtocolError::UnknownPartition(name.to_owned()))?;
            }
            "cleanmarkers" => {
                map.entries[current].flags |= CLEANMARKERS_MODE;
            }
            // Tolerate directives from newer senders.
            _ => {}
        }
    }

    Ok(ParsedSpec { map, digests })
}

#[cfg(test)]
const SAMPLE: &str = "\
partitions: boot 10 system -1
set-partition: boot
eblock: sha256 00112233
eblock: sha256 44556677
set-partition: system
cleanmarkers
eblock: sha256 8899aabb
frobnicate: whatever
";

#[test]
fn test_parse_sample() {
    let spec = parse_spec(SAMPLE.as_bytes()).unwrap();

    assert_eq!(spec.digests.len(), 3);
    assert_eq!(spec.digests[0].hash_name, "sha256");
    assert_eq!(spec.digests[2].digest, [0x88, 0x99, 0xaa, 0xbb]);

    assert!(spec.map.is_partitioned());
    let [boot, system] = spec.map.real() else {
        panic!("expected two partitions");
    };
    assert_eq!(boot.total_eblocks, 0x10);
    assert_eq!(boot.used_eblocks, 2);
    assert_eq!(boot.flags, 0);
    assert_eq!(system.total_eblocks, u32::MAX);
    assert_eq!(system.used_eblocks, 1);
    assert_eq!(system.flags, CLEANMARKERS_MODE);

    assert_eq!(spec.map.used_total(), 3);
}

#[test]
fn test_parse_unpartitioned() {
    let spec = parse_spec(b"eblock: sha256 0011\neblock: sha256 2233\n").unwrap();
    assert!(!spec.map.is_partitioned());
    assert_eq!(spec.map.used_total(), 2);
    assert_eq!(spec.digests.len(), 2);
}

#[test]
fn test_parse_errors() {
    assert!(matches!(
        parse_spec(b"eblock: sha256 zz\n"),
        Err(ProtocolError::SpecParse(_))
    ));
    assert!(matches!(
        parse_spec(b"partitions: boot\n"),
        Err(ProtocolError::SpecParse(_))
    ));
    assert!(matches!(
        parse_spec(b"set-partition: nosuch\n"),
        Err(ProtocolError::UnknownPartition(_))
    ));
}

#[test]
fn test_parse_size_wraps() {
    assert_eq!(parse_size("-1").unwrap(), u32::MAX);
    assert_eq!(parse_size("10").unwrap(), 0x10);
    assert!(parse_size("0x10").is_err());
}
