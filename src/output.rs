//! Record output sink
//!
//! Writes one CSV file per extraction batch with a fixed header:
//! `name,headline,location,profile_link`.

use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::extract::ExtractedRecord;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Write a full record batch to `path`, replacing any previous file.
pub fn write_records(path: &Path, records: &[ExtractedRecord]) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Header is written explicitly so an empty batch still produces a
    // well-formed file.
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(["name", "headline", "location", "profile_link"])?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!("{} records written to {}", records.len(), path.display());
    Ok(())
}
