//! Packing recorded outputs into cache blobs.
//!
//! A blob is a gzip-compressed tar whose entries are the recorded artifact
//! paths, relative to the rule's output directory.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Pack `artifacts` (relative to `output_dir`) into a blob at `dest`.
pub fn pack<'a>(output_dir: &Path, artifacts: impl IntoIterator<Item = &'a PathBuf>, dest: &Path) -> io::Result<()> {
  let file = File::create(dest)?;
  let encoder = GzEncoder::new(file, Compression::default());
  let mut builder = tar::Builder::new(encoder);
  builder.follow_symlinks(false);

  for rel in artifacts {
    let src = output_dir.join(rel);
    let metadata = std::fs::symlink_metadata(&src)?;
    if metadata.is_dir() {
      builder.append_dir_all(rel, &src)?;
    } else {
      builder.append_path_with_name(&src, rel)?;
    }
  }

  builder.into_inner()?.finish()?;
  Ok(())
}

/// Unpack a blob into `output_dir`, returning the top-level paths it held.
pub fn unpack(blob: &Path, output_dir: &Path) -> io::Result<Vec<PathBuf>> {
  std::fs::create_dir_all(output_dir)?;
  let file = File::open(blob)?;
  let mut archive = tar::Archive::new(GzDecoder::new(file));

  let mut roots = Vec::new();
  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    if path.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("refusing to unpack entry outside output dir: {}", path.display()),
      ));
    }
    if let Some(Component::Normal(first)) = path.components().next() {
      let root = PathBuf::from(first);
      if !roots.contains(&root) {
        roots.push(root);
      }
    }
    entry.unpack_in(output_dir)?;
  }
  Ok(roots)
}
