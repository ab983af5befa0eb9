//! Content-addressed binary store.
//!
//! # Responsibility
//! - Persist blob-valued property content outside the relational backend.
//! - Hand sessions an opaque, content-derived reference.
//!
//! # Invariants
//! - A blob is stored at `root/ab/cd/<sha256>`; writes go through a temp
//!   file and a rename, so readers never see partial content.
//! - Storing identical content twice is a no-op returning the same ref.

use crate::error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Opaque reference to stored binary content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryRef {
    /// Lowercase hex SHA-256 of the content.
    pub digest: String,
    pub length: u64,
}

impl BinaryRef {
    /// Column encoding: `<digest>:<length>`.
    pub fn to_db(&self) -> String {
        format!("{}:{}", self.digest, self.length)
    }

    pub fn parse_db(value: &str) -> Option<Self> {
        let (digest, length) = value.split_once(':')?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            digest: digest.to_ascii_lowercase(),
            length: length.parse().ok()?,
        })
    }
}

/// Filesystem store shared by every session of one repository.
#[derive(Debug, Clone)]
pub struct BinaryManager {
    root: PathBuf,
}

impl BinaryManager {
    pub fn new(root: impl Into<PathBuf>) -> RepoResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores the stream content and returns its reference.
    pub fn get_binary(&self, input: &mut dyn Read) -> RepoResult<BinaryRef> {
        let staging_dir = self.root.join("tmp");
        fs::create_dir_all(&staging_dir)?;
        let staging_path = staging_dir.join(Uuid::new_v4().to_string());

        let result = self.stage(input, &staging_path);
        let (digest, length) = match result {
            Ok(staged) => staged,
            Err(err) => {
                let _ = fs::remove_file(&staging_path);
                return Err(err);
            }
        };

        let target = self.path_for(&digest);
        if target.exists() {
            fs::remove_file(&staging_path)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&staging_path, &target)?;
        }

        log::debug!(
            "event=binary_store module=binary status=ok length={} digest={}",
            length,
            digest
        );
        Ok(BinaryRef { digest, length })
    }

    /// Reads stored content back.
    pub fn read(&self, binary: &BinaryRef) -> RepoResult<Vec<u8>> {
        let path = self.path_for(&binary.digest);
        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(RepoError::InvalidData(
                format!("binary content missing for digest {}", binary.digest),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(&self, binary: &BinaryRef) -> bool {
        self.path_for(&binary.digest).exists()
    }

    fn stage(&self, input: &mut dyn Read, staging_path: &Path) -> RepoResult<(String, u64)> {
        let mut file = fs::File::create(staging_path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
        let mut length = 0_u64;
        loop {
            let read = input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read])?;
            length += read as u64;
        }
        file.sync_all()?;
        Ok((hex::encode(hasher.finalize()), length))
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(digest)
    }
}
