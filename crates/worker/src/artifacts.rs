//! Sequentially named artifact files.
//!
//! Files land at `<root>/<kind>/<category>/<prefix>_<NNNNN>.<ext>`. The
//! sequence number is one past the highest already on disk, and the file
//! is claimed with create-new semantics so two writers never share a name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use genqueue_core::job::JobKind;
use tokio::io::AsyncWriteExt;

/// Give up after this many consecutive name collisions.
const MAX_CLAIM_ATTEMPTS: u32 = 32;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not claim a free file name in {0}")]
    Exhausted(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub path: PathBuf,
    pub filename: String,
    pub sequence: u32,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding artifacts for `kind` and `category`.
    pub fn dir_for(&self, kind: JobKind, category: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(sanitize_component(category, "general"))
    }

    pub async fn save(
        &self,
        kind: JobKind,
        category: &str,
        prefix: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<SavedArtifact, ArtifactError> {
        let dir = self.dir_for(kind, category);
        tokio::fs::create_dir_all(&dir).await?;

        let prefix = sanitize_component(prefix, "image");
        let extension = sanitize_component(extension, "png");
        let mut sequence = highest_sequence(&dir, &prefix).await? + 1;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let filename = format!("{prefix}_{sequence:05}.{extension}");
            let path = dir.join(&filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    tracing::debug!(path = %path.display(), size = bytes.len(), "Artifact saved");
                    return Ok(SavedArtifact {
                        path,
                        filename,
                        sequence,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => sequence += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ArtifactError::Exhausted(dir))
    }
}

/// Highest `<prefix>_<NNNNN>.*` sequence in `dir`, or 0 when there is none.
async fn highest_sequence(dir: &Path, prefix: &str) -> Result<u32, std::io::Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut highest = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(seq) = name.to_str().and_then(|n| parse_sequence(n, prefix)) {
            highest = highest.max(seq);
        }
    }
    Ok(highest)
}

fn parse_sequence(filename: &str, prefix: &str) -> Option<u32> {
    let stem = filename.split_once('.').map_or(filename, |(stem, _)| stem);
    let digits = stem.strip_prefix(prefix)?.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Keep a single safe path component.
fn sanitize_component(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}
