//! On-disk format of failure lists: one decimal failure id per line.
//!
//! The recording side writes exactly one id per line. The reading side is more
//! lenient and accepts any whitespace between ids.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Maximum number of failure ids that are considered. Ids at or above this value can never be
/// selected, and reading a list stops after this many entries.
pub const MAX_FAILURE_COUNT: usize = 10000;

/// Append a single failure id to a failure list.
pub fn write_failure_id<W: Write>(dst: &mut W, id: u32) -> std::io::Result<()> {
    writeln!(dst, "{}", id)
}

/// Parse a failure list. Entries are yielded lazily, so callers can stop early without
/// validating the rest of the file.
pub fn parse_failure_list(file: impl BufRead) -> impl Iterator<Item = Result<u32>> {
    file.lines().enumerate().flat_map(|(idx, line)| {
        let lineno = idx + 1;
        let entries: Vec<Result<u32>> = match line {
            Ok(line) => line
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<u32>()
                        .with_context(|| format!("line {}: invalid failure id {:?}", lineno, token))
                })
                .collect(),
            Err(err) => vec![Err(anyhow::Error::new(err)
                .context(format!("line {}: could not read failure list", lineno)))],
        };
        entries
    })
}
