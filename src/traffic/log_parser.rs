//! Access log parsing.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::LazyLock;

use regex::bytes::Regex;

static USAGE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"uuid:(\S+)\s+bytes:(\d+)").expect("regex"));

pub const BYTES_PER_GB: u64 = 1 << 30;

/// Byte totals per credential plus the number of lines that looked like
/// usage records but could not be read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogTotals {
    pub bytes: HashMap<String, u64>,
    pub skipped: u64,
}

impl LogTotals {
    /// Whole gigabytes per credential, rounded down after summing.
    pub fn gigabytes(&self) -> HashMap<String, u64> {
        self.bytes
            .iter()
            .map(|(cred, bytes)| (cred.clone(), bytes / BYTES_PER_GB))
            .collect()
    }
}

/// Sum transferred bytes per credential over every line of `reader`.
///
/// Lines are split on `\n` as raw bytes so invalid UTF-8 in one line never
/// aborts the scan; lines without a usage record are ignored.
pub fn parse_access_log<R: BufRead>(mut reader: R) -> std::io::Result<LogTotals> {
    let mut totals = LogTotals::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let Some(caps) = USAGE_LINE.captures(&line) else {
            continue;
        };
        let credential = String::from_utf8_lossy(&caps[1]).into_owned();
        let parsed = std::str::from_utf8(&caps[2])
            .ok()
            .and_then(|digits| digits.parse::<u64>().ok());
        match parsed {
            Some(bytes) => {
                let entry = totals.bytes.entry(credential).or_insert(0);
                *entry = entry.saturating_add(bytes);
            }
            None => totals.skipped += 1,
        }
    }
    Ok(totals)
}
