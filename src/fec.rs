//! Erasure-code integration.
//!
//! A block of `data` symbols is expanded to `total` symbols; any `data`
//! distinct symbols reconstruct the block. The coding itself is
//! Reed-Solomon over GF(2^8); this module only adapts it to the packet
//! stream's symbol-index convention. A `total == data` configuration is legal
//! on the wire (no redundancy) and handled here without the RS library.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::ProtocolError;

/// GF(2^8) limits a coded block to this many symbols in total.
pub const MAX_SYMBOLS: usize = 256;

pub struct BlockCoder {
    data: usize,
    total: usize,
    symbol_size: usize,
    /// None when the stream carries no parity symbols.
    rs: Option<ReedSolomon>,
}

impl BlockCoder {
    pub fn new(data: usize, total: usize, symbol_size: usize) -> Result<Self, ProtocolError> {
        if data == 0 || total < data || total > MAX_SYMBOLS {
            return Err(ProtocolError::BadSymbolCount {
                nr_pkts: total as u16,
                needed: data,
            });
        }

        let rs = if total > data {
            Some(
                ReedSolomon::new(data, total - data)
                    .map_err(|e| ProtocolError::FecDecode(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self {
            data,
            total,
            symbol_size,
            rs,
        })
    }

    pub fn data_symbols(&self) -> usize {
        self.data
    }

    pub fn total_symbols(&self) -> usize {
        self.total
    }

    /// Encode one block into `total` symbols. `block` may be shorter than
    /// `data * symbol_size`; the tail is padded with zeros.
    pub fn encode(&self, block: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        anyhow::ensure!(
            block.len() <= self.data * self.symbol_size,
            "block larger than {} coded bytes",
            self.data * self.symbol_size
        );

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total);
        for i in 0..self.data {
            let mut shard = vec![0u8; self.symbol_size];
            let start = i * self.symbol_size;
            if start < block.len() {
                let n = usize::min(self.symbol_size, block.len() - start);
                shard[..n].copy_from_slice(&block[start..start + n]);
            }
            shards.push(shard);
        }
        shards.resize(self.total, vec![0u8; self.symbol_size]);

        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)?;
        }

        Ok(shards)
    }

    /// Reconstruct the block from `data` received symbols in arrival order,
    /// with `indices[i]` giving the symbol index of `received[i]`.
    ///
    /// Returns the full `data * symbol_size` bytes; the caller truncates to the
    /// real block size.
    pub fn decode(
        &self,
        received: &[&[u8]],
        indices: &[u16],
    ) -> Result<Vec<u8>, ProtocolError> {
        if received.len() != self.data || indices.len() != self.data {
            return Err(ProtocolError::FecDecode(format!(
                "have {} symbols, need {}",
                received.len(),
                self.data
            )));
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.total];
        for (symbol, &index) in received.iter().zip(indices) {
            if symbol.len() != self.symbol_size {
                return Err(ProtocolError::FecDecode("bad symbol size".into()));
            }
            let slot = shards
                .get_mut(index as usize)
                .ok_or_else(|| ProtocolError::FecDecode(format!("symbol index {index} out of range")))?;
            if slot.replace(symbol.to_vec()).is_some() {
                return Err(ProtocolError::FecDecode(format!("symbol index {index} repeated")));
            }
        }

        if let Some(rs) = &self.rs {
            rs.reconstruct_data(&mut shards)
                .map_err(|e| ProtocolError::FecDecode(e.to_string()))?;
        }

        let mut block = Vec::with_capacity(self.data * self.symbol_size);
        for shard in shards.into_iter().take(self.data) {
            // Without parity every data symbol must have been received.
            let shard = shard.ok_or_else(|| ProtocolError::FecDecode("missing data symbol".into()))?;
            block.extend_from_slice(&shard);
        }
        Ok(block)
    }
}

#[cfg(test)]
fn test_block(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 257) as u8).collect()
}

#[test]
fn test_encode_decode_with_losses() {
    let coder = BlockCoder::new(4, 7, 32).unwrap();
    let block = test_block(4 * 32);
    let symbols = coder.encode(&block).unwrap();
    assert_eq!(symbols.len(), 7);

    // Receive symbols 6, 2, 4, 0 in that order; 1, 3, 5 are lost.
    let order = [6u16, 2, 4, 0];
    let received: Vec<&[u8]> = order.iter().map(|&i| symbols[i as usize].as_slice()).collect();
    let decoded = coder.decode(&received, &order).unwrap();
    assert_eq!(decoded, block);
}

#[test]
fn test_decode_without_parity() {
    let coder = BlockCoder::new(3, 3, 16).unwrap();
    let block = test_block(3 * 16);
    let symbols = coder.encode(&block).unwrap();

    let order = [2u16, 0, 1];
    let received: Vec<&[u8]> = order.iter().map(|&i| symbols[i as usize].as_slice()).collect();
    assert_eq!(coder.decode(&received, &order).unwrap(), block);
}

#[test]
fn test_decode_rejects_duplicates_and_range() {
    let coder = BlockCoder::new(2, 4, 8).unwrap();
    let symbols = coder.encode(&test_block(16)).unwrap();

    let dup: Vec<&[u8]> = vec![&symbols[1], &symbols[1]];
    assert!(coder.decode(&dup, &[1, 1]).is_err());

    let out: Vec<&[u8]> = vec![&symbols[0], &symbols[1]];
    assert!(coder.decode(&out, &[0, 9]).is_err());
}

#[test]
fn test_short_block_is_padded() {
    let coder = BlockCoder::new(4, 6, 32).unwrap();
    let block = test_block(4 * 32 - 10);
    let symbols = coder.encode(&block).unwrap();

    let order = [5u16, 1, 3, 2];
    let received: Vec<&[u8]> = order.iter().map(|&i| symbols[i as usize].as_slice()).collect();
    let decoded = coder.decode(&received, &order).unwrap();
    assert_eq!(&decoded[..block.len()], &block[..]);
    assert!(decoded[block.len()..].iter().all(|&x| x == 0));
}

#[test]
fn test_bad_geometry() {
    assert!(BlockCoder::new(0, 4, 8).is_err());
    assert!(BlockCoder::new(5, 4, 8).is_err());
    assert!(BlockCoder::new(200, 300, 8).is_err());
}
