//! Append-only log of finished optimization attempts.
//!
//! One JSON record per line. Only terminal records are written, so each id
//! normally appears once; on replay the last line for an id wins.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::OptimizationRecord;

#[derive(Debug, Clone)]
pub struct OptimizationJournal {
    path: PathBuf,
}

impl OptimizationJournal {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record.
    pub fn append(&self, record: &OptimizationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Every recorded attempt in first-seen order. Unparseable lines are
    /// skipped.
    pub fn read_records(&self) -> Result<Vec<OptimizationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).context("Failed to open optimization journal")?;
        let reader = BufReader::new(file);

        let mut records: Vec<OptimizationRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for line in reader.lines().map_while(std::result::Result::ok) {
            let Ok(record) = serde_json::from_str::<OptimizationRecord>(&line) else {
                continue;
            };
            match index.get(&record.id) {
                Some(&i) => records[i] = record,
                None => {
                    index.insert(record.id.clone(), records.len());
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}
