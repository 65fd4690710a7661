//! COPY/INSERT delta computation.
//!
//! Block-matching in the rsync style:
//! 1. Split old data into fixed-size blocks and index them by rolling hash.
//! 2. Slide a block-sized window over the new data.
//! 3. A window whose rolling hash and BLAKE3 digest match an old block becomes
//!    a `Copy`; unmatched bytes accumulate into `Insert`s.
//!
//! Adjacent copies of consecutive old blocks are merged, which keeps the
//! encoded delta for a mostly-unchanged file to a handful of chunks.

use std::collections::HashMap;

use crate::error::{PatchError, Result};
use crate::patch_format::DiffChunk;
use crate::rolling_hash::RollingHash;

pub const BLOCK_SIZE: usize = 4096;

struct BlockSignature {
    strong: blake3::Hash,
    offset: usize,
    len: usize,
}

/// Index of the old file's blocks by rolling digest.
struct BlockIndex {
    blocks: Vec<BlockSignature>,
    by_digest: HashMap<u32, Vec<usize>>,
}

impl BlockIndex {
    fn build(old: &[u8]) -> Self {
        let blocks: Vec<BlockSignature> = old
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(|(i, block)| BlockSignature {
                strong: blake3::hash(block),
                offset: i * BLOCK_SIZE,
                len: block.len(),
            })
            .collect();
        let mut by_digest: HashMap<u32, Vec<usize>> = HashMap::with_capacity(blocks.len());
        for (idx, sig) in blocks.iter().enumerate() {
            let digest = RollingHash::over(&old[sig.offset..sig.offset + sig.len]).digest();
            by_digest.entry(digest).or_default().push(idx);
        }
        Self { blocks, by_digest }
    }

    /// Old block matching `window` exactly, if any.
    fn lookup(&self, digest: u32, window: &[u8]) -> Option<&BlockSignature> {
        let candidates = self.by_digest.get(&digest)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .map(|&i| &self.blocks[i])
            .find(|sig| sig.len == window.len() && sig.strong == strong)
    }
}

/// Accumulates chunks, merging contiguous copies.
#[derive(Default)]
struct ChunkSink {
    chunks: Vec<DiffChunk>,
    pending: Vec<u8>,
}

impl ChunkSink {
    fn literal(&mut self, byte: u8) {
        self.pending.push(byte);
    }

    fn literals(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn copy(&mut self, offset: u64, length: u64) {
        self.flush_literals();
        if let Some(DiffChunk::Copy {
            offset: prev_offset,
            length: prev_length,
        }) = self.chunks.last_mut()
        {
            if *prev_offset + *prev_length == offset {
                *prev_length += length;
                return;
            }
        }
        self.chunks.push(DiffChunk::Copy { offset, length });
    }

    fn flush_literals(&mut self) {
        if !self.pending.is_empty() {
            self.chunks.push(DiffChunk::Insert {
                data: std::mem::take(&mut self.pending),
            });
        }
    }

    fn finish(mut self) -> Vec<DiffChunk> {
        self.flush_literals();
        self.chunks
    }
}

/// Compute a delta turning `old` into `new`.
pub fn compute_diff(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
    let mut sink = ChunkSink::default();
    if old.is_empty() || new.len() < BLOCK_SIZE {
        sink.literals(new);
        return sink.finish();
    }

    let index = BlockIndex::build(old);
    let mut pos = 0usize;
    let mut rolling = RollingHash::over(&new[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= new.len() {
        let window = &new[pos..pos + BLOCK_SIZE];
        if let Some(sig) = index.lookup(rolling.digest(), window) {
            sink.copy(sig.offset as u64, sig.len as u64);
            pos += sig.len;
            if pos + BLOCK_SIZE <= new.len() {
                rolling = RollingHash::over(&new[pos..pos + BLOCK_SIZE]);
            }
        } else {
            sink.literal(new[pos]);
            pos += 1;
            if pos + BLOCK_SIZE <= new.len() {
                rolling.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Tail shorter than one block.
    sink.literals(&new[pos..]);
    sink.finish()
}

/// Serialized form carried in the payload stream.
pub fn encode_delta(chunks: &[DiffChunk]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(chunks)?)
}

pub fn decode_delta(bytes: &[u8]) -> Result<Vec<DiffChunk>> {
    bincode::deserialize(bytes).map_err(|e| PatchError::format(format!("corrupt delta: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::apply_diff_to_vec;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_identical_data_is_one_copy() {
        let data = patterned(BLOCK_SIZE * 3);
        let chunks = compute_diff(&data, &data);
        assert_eq!(
            chunks,
            vec![DiffChunk::Copy {
                offset: 0,
                length: data.len() as u64
            }]
        );
        assert_eq!(apply_diff_to_vec(&data, &chunks).unwrap(), data);
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; BLOCK_SIZE * 2];
        let new = vec![1u8; BLOCK_SIZE * 2];
        let chunks = compute_diff(&old, &new);
        assert_eq!(apply_diff_to_vec(&old, &chunks).unwrap(), new);
    }

    #[test]
    fn test_prefix_changed_keeps_tail_copies() {
        let old = patterned(BLOCK_SIZE * 4);
        let mut new = old.clone();
        new[..BLOCK_SIZE].fill(0xFF);

        let chunks = compute_diff(&old, &new);
        assert_eq!(apply_diff_to_vec(&old, &chunks).unwrap(), new);
        let copied: u64 = chunks
            .iter()
            .map(|c| match c {
                DiffChunk::Copy { length, .. } => *length,
                DiffChunk::Insert { .. } => 0,
            })
            .sum();
        assert!(copied >= (BLOCK_SIZE * 3) as u64);
    }

    #[test]
    fn test_empty_inputs() {
        let chunks = compute_diff(&[], &[1u8; 100]);
        assert_eq!(apply_diff_to_vec(&[], &chunks).unwrap(), vec![1u8; 100]);

        let chunks = compute_diff(&[1u8; 100], &[]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_insertion_in_middle() {
        let old = patterned(BLOCK_SIZE * 4);
        let mut new = old.clone();
        new.splice(BLOCK_SIZE * 2..BLOCK_SIZE * 2, vec![0xAA; 100]);

        let chunks = compute_diff(&old, &new);
        assert_eq!(apply_diff_to_vec(&old, &chunks).unwrap(), new);
        let encoded = encode_delta(&chunks).unwrap();
        assert!(encoded.len() < new.len() / 2);
        assert_eq!(decode_delta(&encoded).unwrap(), chunks);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_delta(&[0xFF; 3]),
            Err(PatchError::Format { .. })
        ));
    }
}
