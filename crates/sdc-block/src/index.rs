//! Block index trailer.
//!
//! The index is a short YAML-flavoured text section written after the last
//! block. It lists the absolute offset of each block's magic so a reader can
//! seek straight to block `n` without decoding the records before it.

use tracing::{debug, warn};

use crate::error::{BlockError, BlockResult};
use crate::header::BLOCK_MAGIC;
use crate::io::BlockFile;

/// First line of the index trailer.
pub const INDEX_HEADER: &[u8] = b"#SDC BLOCK INDEX";

const INDEX_PREAMBLE: &str = "#SDC BLOCK INDEX\n%YAML 1.1\n---\n";
const INDEX_END: &str = "...";

/// Render the index trailer for `offsets`.
pub fn encode_index(offsets: &[u64]) -> Vec<u8> {
    let mut out = String::with_capacity(INDEX_PREAMBLE.len() + offsets.len() * 12 + 4);
    out.push_str(INDEX_PREAMBLE);
    for offset in offsets {
        out.push_str("- ");
        out.push_str(&offset.to_string());
        out.push('\n');
    }
    out.push_str(INDEX_END);
    out.push('\n');
    out.into_bytes()
}

/// Parse an index trailer, starting at its header line.
pub fn parse_index(bytes: &[u8]) -> BlockResult<Vec<u64>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BlockError::IndexCorrupted(format!("not utf-8: {e}")))?;
    let mut lines = text.lines();
    let mut expect = |want: &str| match lines.next() {
        Some(line) if line.trim_end() == want => Ok(()),
        other => Err(BlockError::IndexCorrupted(format!(
            "expected {want:?}, got {other:?}"
        ))),
    };
    expect("#SDC BLOCK INDEX")?;
    expect("%YAML 1.1")?;
    expect("---")?;

    let mut offsets = Vec::new();
    for line in lines {
        let line = line.trim_end();
        if line == INDEX_END {
            return Ok(offsets);
        }
        let value = line
            .strip_prefix("- ")
            .ok_or_else(|| BlockError::IndexCorrupted(format!("unexpected line {line:?}")))?;
        let offset = value
            .trim()
            .parse::<u64>()
            .map_err(|e| BlockError::IndexCorrupted(format!("bad offset {value:?}: {e}")))?;
        offsets.push(offset);
    }
    Err(BlockError::IndexCorrupted("missing document end marker".into()))
}

/// Write the index trailer at `pos`. Returns the position just after it.
pub fn write_block_index(file: &BlockFile, pos: u64, offsets: &[u64]) -> BlockResult<u64> {
    let bytes = encode_index(offsets);
    file.write_at(pos, &bytes)?;
    debug!(offset = pos, blocks = offsets.len(), "wrote block index");
    Ok(pos + bytes.len() as u64)
}

/// Locate the index header, scanning backward from end-of-file but never
/// before `min_offset`. Returns the header position.
pub fn find_index_header(
    file: &BlockFile,
    min_offset: u64,
    chunk_size: usize,
) -> BlockResult<Option<u64>> {
    let len = file.len()?;
    if len <= min_offset {
        return Ok(None);
    }
    let chunk = chunk_size.max(INDEX_HEADER.len()) as u64;
    let mut end = len;
    loop {
        let start = end.saturating_sub(chunk).max(min_offset);
        // Overlap the previous window so a header split across chunks is seen.
        let read_end = (end + INDEX_HEADER.len() as u64 - 1).min(len);
        let window = file.read_up_to(start, (read_end - start) as usize)?;
        if let Some(found) = window
            .windows(INDEX_HEADER.len())
            .rposition(|w| w == INDEX_HEADER)
        {
            return Ok(Some(start + found as u64));
        }
        if start == min_offset {
            return Ok(None);
        }
        end = start;
    }
}

/// Find and validate the block index of `file`, whose first block sits at
/// `first_offset`.
///
/// Returns `None` when there is no index, and also when an index exists but
/// does not validate; callers then fall back to a sequential scan.
pub fn find_index(
    file: &BlockFile,
    first_offset: u64,
    chunk_size: usize,
) -> BlockResult<Option<Vec<u64>>> {
    let Some(index_pos) = find_index_header(file, first_offset, chunk_size)? else {
        return Ok(None);
    };
    let bytes = file.read_to_end_from(index_pos)?;
    let offsets = match parse_index(&bytes) {
        Ok(offsets) => offsets,
        Err(e) => {
            warn!(offset = index_pos, error = %e, "ignoring unreadable block index");
            return Ok(None);
        }
    };
    match validate(file, &offsets, first_offset, index_pos) {
        Ok(()) => {
            debug!(offset = index_pos, blocks = offsets.len(), "using block index");
            Ok(Some(offsets))
        }
        Err(reason) => {
            warn!(offset = index_pos, %reason, "ignoring invalid block index");
            Ok(None)
        }
    }
}

fn validate(
    file: &BlockFile,
    offsets: &[u64],
    first_offset: u64,
    index_pos: u64,
) -> Result<(), String> {
    let (Some(&first), Some(&last)) = (offsets.first(), offsets.last()) else {
        return Err("index is empty".into());
    };
    if first != first_offset {
        return Err(format!(
            "first offset {first} does not match first block at {first_offset}"
        ));
    }
    if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err("offsets are not strictly increasing".into());
    }
    if last >= index_pos {
        return Err(format!("offset {last} is not before the index at {index_pos}"));
    }
    let mut magic = [0u8; 4];
    match file.read_at(last, &mut magic) {
        Ok(()) if magic == BLOCK_MAGIC => Ok(()),
        Ok(()) => Err(format!("no block magic at offset {last}")),
        Err(e) => Err(format!("cannot read offset {last}: {e}")),
    }
}
