//! # Output File
//!
//! The download target is created and sized up front, then filled in by
//! verified pieces as they complete. Writes are positional only: sessions
//! share one handle without sharing a seek cursor, and every piece targets
//! its own disjoint byte range.

use anyhow::{anyhow, Result};

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Pre-allocated download target shared by all peer sessions.
pub struct OutputFile {
    file: File,
}

impl OutputFile {
    /// Create the file at `path` and extend it to its final length.
    pub fn create(path: &Path, length: u64) -> Result<OutputFile> {
        let file = match File::create(path) {
            Ok(file) => file,
            Err(e) => return Err(anyhow!("could not create output file {:?}: {e}", path)),
        };

        if file.set_len(length).is_err() {
            return Err(anyhow!("could not allocate output file {:?}", path));
        }

        Ok(OutputFile { file })
    }

    /// Write a verified piece at its offset in the file.
    pub fn write_piece(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.file.write_all_at(data, offset).is_err() {
            return Err(anyhow!("could not write piece at offset {offset}"));
        }

        Ok(())
    }
}
