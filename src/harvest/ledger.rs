//! Append-only ledger of fully processed images.
//!
//! One identity per line, newline-terminated. Records are written one at a
//! time, so a crash mid-append loses at most the records after the last
//! complete line; those images are simply processed again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::model::{ImageId, ImageSet};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to append to ledger {path} after {written} records: {source}")]
    Append {
        path: PathBuf,
        written: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Image identity {0:?} contains a newline")]
    InvalidIdentity(String),
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every recorded identity. A missing file is a fresh start.
    pub async fn load(&self) -> Result<ImageSet, LedgerError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    path = %self.path.display(),
                    "No previously collected images, fresh start"
                );
                return Ok(ImageSet::new());
            }
            Err(source) => {
                return Err(LedgerError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let processed: ImageSet = content
            .lines()
            .filter(|line| !line.is_empty())
            .map(ImageId::from)
            .collect();

        info!(
            path = %self.path.display(),
            images = processed.len(),
            "Loaded processed-image ledger"
        );
        Ok(processed)
    }

    /// Durably records `images`. Existing records are never touched.
    pub async fn append(&self, images: &[ImageId]) -> Result<(), LedgerError> {
        if let Some(bad) = images.iter().find(|id| id.as_str().contains('\n')) {
            return Err(LedgerError::InvalidIdentity(bad.to_string()));
        }

        let mut written = 0;
        let append_err = |written, source| LedgerError::Append {
            path: self.path.clone(),
            written,
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| append_err(written, e))?;

        if ends_with_torn_record(&mut file)
            .await
            .map_err(|e| append_err(written, e))?
        {
            warn!(path = %self.path.display(), "Terminating torn last ledger record");
            file.write_all(b"\n")
                .await
                .map_err(|e| append_err(written, e))?;
        }

        for image in images {
            let record = format!("{}\n", image);
            file.write_all(record.as_bytes())
                .await
                .map_err(|e| append_err(written, e))?;
            written += 1;
        }

        file.flush().await.map_err(|e| append_err(written, e))?;
        if let Err(e) = file.sync_data().await {
            // The records are written; only the fsync guarantee is missing.
            warn!(path = %self.path.display(), error = %e, "Ledger sync failed");
        }

        debug!(path = %self.path.display(), records = written, "Appended to ledger");
        Ok(())
    }
}

/// True when the file is non-empty and its last byte is not a newline.
async fn ends_with_torn_record(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}
