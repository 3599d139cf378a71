//! Content hashing for rule inputs and build outputs.
//!
//! Every hash is a lowercase hex SHA-256 digest. Files hash their bytes,
//! output trees hash a stream of tagged entries in file name order, and
//! [`hash_path`] separates the three kinds of filesystem node so that a file
//! can never hash like a directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hex SHA-256 digest of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  fn from_hasher(hasher: Sha256) -> Self {
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
}

impl HashError {
  fn read(path: &Path, source: io::Error) -> Self {
    HashError::Read {
      path: path.to_path_buf(),
      source,
    }
  }
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash::from_hasher(Sha256::new_with_prefix(data))
}

/// Stream a file's bytes through SHA-256.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut file = fs::File::open(path).map_err(|e| HashError::read(path, e))?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(|e| HashError::read(path, e))?;
  Ok(ContentHash::from_hasher(hasher))
}

/// Hash an output tree.
///
/// Each entry contributes its kind, its `/`-separated path relative to `root`
/// and its payload: the content digest and executable bit for files, the link
/// text for symlinks, nothing for directories. Timestamps and ownership are
/// ignored. Sockets and devices are skipped.
pub fn hash_tree(root: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Sha256::new();

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| HashError::Walk {
      path: root.to_path_buf(),
      source: e,
    })?;
    let rel = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");

    let file_type = entry.file_type();
    let (tag, payload) = if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| HashError::read(entry.path(), e))?;
      (b'L', target.to_string_lossy().into_owned())
    } else if file_type.is_dir() {
      (b'D', String::new())
    } else if file_type.is_file() {
      let digest = hash_file(entry.path())?;
      let mode = if is_executable(entry.path())? { "x" } else { "-" };
      (b'F', format!("{}{}", mode, digest))
    } else {
      continue;
    };

    hasher.update([tag]);
    hasher.update(rel.as_bytes());
    hasher.update([0]);
    hasher.update(payload.as_bytes());
    hasher.update([b'\n']);
  }

  Ok(ContentHash::from_hasher(hasher))
}

/// Hash whatever lives at `path` without following a final symlink.
pub fn hash_path(path: &Path) -> Result<ContentHash, HashError> {
  let metadata = fs::symlink_metadata(path).map_err(|e| HashError::read(path, e))?;

  let (kind, inner) = if metadata.file_type().is_symlink() {
    let target = fs::read_link(path).map_err(|e| HashError::read(path, e))?;
    ("link", hash_bytes(target.to_string_lossy().as_bytes()))
  } else if metadata.is_dir() {
    ("tree", hash_tree(path)?)
  } else {
    ("file", hash_file(path)?)
  };

  Ok(hash_bytes(format!("{}:{}", kind, inner).as_bytes()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool, HashError> {
  use std::os::unix::fs::PermissionsExt;

  let metadata = fs::metadata(path).map_err(|e| HashError::read(path, e))?;
  Ok(metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool, HashError> {
  Ok(false)
}
