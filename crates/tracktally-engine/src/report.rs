use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracktally_core::CountEntry;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("report {name} not found")]
    NotFound { name: String },
    #[error("report fetch failed: {0}")]
    Failed(String),
}

/// Where count reports come from. Transport is a collaborator concern;
/// the fallback chain, gating, and persistence live in the cache.
pub trait ReportSource {
    fn fetch(&self, name: &str) -> Result<String, FetchError>;
}

/// Report source backed by a directory of `T_*.txt` / `J_*.txt` files.
pub struct DirReportSource {
    root: PathBuf,
}

impl DirReportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ReportSource for DirReportSource {
    fn fetch(&self, name: &str) -> Result<String, FetchError> {
        let path = self.root.join(name);
        fs::read_to_string(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => FetchError::NotFound {
                name: name.to_string(),
            },
            _ => FetchError::Failed(err.to_string()),
        })
    }
}

/// Parse a plain-text count report into count entries.
///
/// A line contributes an entry iff it matches
/// `<ordinal>. Track ID: <id>, Shape Count: <count>`; the entry pairs the
/// track id with the count. Anything else (blank lines, trailer noise)
/// is dropped without error, so empty input parses to an empty list.
pub fn parse_report(text: &str) -> Vec<CountEntry> {
    let pattern =
        Regex::new(r"\d+\.\s+Track ID:\s+(\d+),\s+Shape Count:\s+(\d+)").expect("valid regex");
    let mut entries = Vec::new();
    for line in text.lines() {
        let Some(captures) = pattern.captures(line) else {
            continue;
        };
        let (Some(id), Some(count)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let (Ok(client_id), Ok(count)) = (id.as_str().parse(), count.as_str().parse()) else {
            continue;
        };
        entries.push(CountEntry::new(client_id, count));
    }
    entries
}

/// Hex SHA-256 of the raw report text, used to detect report version
/// changes across bootstraps.
pub fn report_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
