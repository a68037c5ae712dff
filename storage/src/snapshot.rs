use pagecite_core::model::DocumentInfo;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

const FILE_PREFIX: &str = "docmap_";
const FILE_SUFFIX: &str = ".rkyv";
const VERSION_DIGITS: usize = 20;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error")]
    Serialization,
    #[error("Corrupt snapshot: {0}")]
    Corrupt(PathBuf),
}

/// On-disk form of a document map.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct DocumentMapRecord {
    pub version: u64,
    pub documents: Vec<DocumentInfo>,
}

/// Versioned `docmap_{version}.rkyv` files in one directory.
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{version:0width$}{FILE_SUFFIX}", width = VERSION_DIGITS))
    }

    /// Write a snapshot for `record.version`.
    /// Atomically writes to a temp file then renames.
    pub async fn create_snapshot(&self, record: &DocumentMapRecord) -> Result<PathBuf, SnapshotError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }

        let bytes = rkyv::to_bytes::<_, 1024>(record).map_err(|_| SnapshotError::Serialization)?;
        let path = self.path_for(record.version);
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, &bytes[..]).await?;
        fs::rename(&tmp_path, &path).await?;

        Ok(path)
    }

    pub async fn read_snapshot(&self, version: u64) -> Result<DocumentMapRecord, SnapshotError> {
        let path = self.path_for(version);
        let raw = fs::read(&path).await?;

        // rkyv validation needs the archive at its natural alignment.
        let mut aligned = AlignedVec::with_capacity(raw.len());
        aligned.extend_from_slice(&raw);

        let archived = rkyv::check_archived_root::<DocumentMapRecord>(&aligned[..])
            .map_err(|_| SnapshotError::Corrupt(path.clone()))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|_| SnapshotError::Corrupt(path))
    }

    /// Every snapshot version present in the directory, ascending.
    pub async fn versions(&self) -> Result<Vec<u64>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut versions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(version) = parse_version(file_name) {
                versions.push(version);
            }
        }

        versions.sort_unstable();
        Ok(versions)
    }
}

fn parse_version(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    if digits.len() != VERSION_DIGITS {
        return None;
    }
    digits.parse().ok()
}
