//! JSON persistence of block records.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use crate::chain::GENESIS;
use crate::error::ChainIntegrityError;
use crate::models::BlockRecord;

pub fn load_blocks(path: &Path) -> io::Result<Vec<BlockRecord>> {
    let mut file = OpenOptions::new().read(true).open(path)?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let blocks: Vec<BlockRecord> = serde_json::from_str(&contents)?;
    Ok(blocks)
}

pub fn save_blocks(path: &Path, blocks: &[BlockRecord]) -> io::Result<()> {
    let mut file = File::create(path)?;

    let blocks_json = serde_json::to_string_pretty(blocks)?;
    write!(file, "{}", blocks_json)?;

    Ok(())
}

/// Checks the hash links of a persisted log. Needs no keys: headers are
/// compared as recorded.
pub fn verify_links(blocks: &[BlockRecord]) -> Result<(), ChainIntegrityError> {
    let mut previous: Option<&str> = None;
    for block in blocks {
        if block.previous_header.as_deref() != previous {
            return Err(ChainIntegrityError {
                expected: previous.unwrap_or(GENESIS).to_string(),
                found: block.previous_header.as_deref().unwrap_or(GENESIS).to_string(),
            });
        }
        previous = Some(&block.header);
    }
    Ok(())
}
