use std::io::Write;
use std::path::Path;

use crate::error::{io_err, PatchError, Result};
use crate::interrupt::{Interrupter, COPY_BUFFER_SIZE};
use crate::patch_format::DiffChunk;

/// Size of the file a delta produces, saturating at `u64::MAX`.
pub fn output_len(chunks: &[DiffChunk]) -> u64 {
    chunks.iter().fold(0u64, |total, c| {
        total.saturating_add(match c {
            DiffChunk::Copy { length, .. } => *length,
            DiffChunk::Insert { data } => data.len() as u64,
        })
    })
}

/// Reconstruct the new file from the old file data and a sequence of diff
/// chunks, writing it to `out`. Copies that reach outside `old` mean the delta
/// was built against different content and are rejected.
pub fn apply_diff<W: Write + ?Sized>(
    old: &[u8],
    chunks: &[DiffChunk],
    out: &mut W,
    interrupter: &Interrupter,
    dest: &Path,
) -> Result<()> {
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let start = usize::try_from(*offset).unwrap_or(usize::MAX);
                let end = usize::try_from(*length)
                    .ok()
                    .and_then(|len| start.checked_add(len))
                    .filter(|&end| end <= old.len())
                    .ok_or_else(|| {
                        PatchError::format(format!(
                            "delta copies {length} bytes at {offset} from a {}-byte source",
                            old.len()
                        ))
                    })?;
                for piece in old[start..end].chunks(COPY_BUFFER_SIZE) {
                    interrupter.checkpoint()?;
                    out.write_all(piece).map_err(|e| io_err(dest, e))?;
                }
            }
            DiffChunk::Insert { data } => {
                interrupter.checkpoint()?;
                out.write_all(data).map_err(|e| io_err(dest, e))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn apply_diff_to_vec(old: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    apply_diff(old, chunks, &mut out, &Interrupter::new(), Path::new("<memory>"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mixed() {
        let old = b"AAAA_BBBB_CCCC";
        let chunks = vec![
            DiffChunk::Copy {
                offset: 0,
                length: 5,
            },
            DiffChunk::Insert {
                data: b"XXXX_".to_vec(),
            },
            DiffChunk::Copy {
                offset: 10,
                length: 4,
            },
        ];
        assert_eq!(output_len(&chunks), 14);
        assert_eq!(apply_diff_to_vec(old, &chunks).unwrap(), b"AAAA_XXXX_CCCC");
    }

    #[test]
    fn test_apply_empty_chunks() {
        assert!(apply_diff_to_vec(b"some data", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_copy_past_end_is_format_error() {
        let chunks = vec![DiffChunk::Copy {
            offset: 4,
            length: 10,
        }];
        assert!(matches!(
            apply_diff_to_vec(b"short", &chunks),
            Err(PatchError::Format { .. })
        ));
    }

    #[test]
    fn test_cancelled_apply_stops() {
        let interrupter = Interrupter::new();
        interrupter.cancel();
        let chunks = vec![DiffChunk::Insert { data: vec![1] }];
        let mut out = Vec::new();
        let err = apply_diff(b"", &chunks, &mut out, &interrupter, Path::new("x")).unwrap_err();
        assert!(matches!(err, PatchError::Cancelled));
        assert!(out.is_empty());
    }
}
