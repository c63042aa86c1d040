use std::path::{Path, PathBuf};

use compio::{BufResult, fs::File, io::AsyncReadAt};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

use crate::ext::BestEffortPathExt;
use crate::tree::is_concurrent_change;

/// Files are hashed in chunks of this size, never read whole.
const CHUNK_SIZE: usize = 64 * 1024;

/// Size and SHA-256 of the bytes read from one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub hex: String,
}

impl FileDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            size: bytes.len() as u64,
            hex: format!("{:x}", hasher.finalize()),
        }
    }

    /// Streams the file through SHA-256. `Ok(None)` means the file vanished
    /// or became a directory before it could be read.
    pub async fn of_file(path: &Path) -> Result<Option<Self>, FileDigestError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if is_concurrent_change(&e) => return Ok(None),
            Err(e) => {
                return Err(e).context(OpenSnafu {
                    path: path.to_path_buf(),
                });
            }
        };

        let mut hasher = Sha256::new();
        let mut position = 0u64;
        let mut buffer: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);

        loop {
            buffer.clear();
            let BufResult(result, returned) = file.read_at(buffer, position).await;
            buffer = returned;
            let read = match result {
                Ok(read) => read,
                Err(e) if is_concurrent_change(&e) => return Ok(None),
                Err(e) => {
                    return Err(e).context(ReadSnafu {
                        path: path.to_path_buf(),
                    });
                }
            };
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            position += read as u64;
        }

        Ok(Some(FileDigest {
            size: position,
            hex: format!("{:x}", hasher.finalize()),
        }))
    }
}

#[derive(Debug, Snafu)]
pub enum FileDigestError {
    #[snafu(display("Failed to open {} for hashing", path.best_effort_path_display()))]
    OpenError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read {} while hashing", path.best_effort_path_display()))]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
}
