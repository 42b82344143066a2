//! Package-root discovery.

use std::path::{Path, PathBuf};

use tracing::trace;

use super::MANIFEST_FILE_NAME;

/// Sentinel every real manifest mentions; a bare file named like a manifest
/// does not make a package.
const PACKAGE_DESCRIPTION_SENTINEL: &str = "PackageDescription";

/// Walk upward from `start` to the nearest directory containing a package
/// manifest whose contents mention the package-description sentinel.
pub fn find_package_root(start: &Path) -> Option<PathBuf> {
  let mut current = start.to_path_buf();

  loop {
    let manifest = current.join(MANIFEST_FILE_NAME);
    if manifest.is_file() {
      match std::fs::read_to_string(&manifest) {
        Ok(contents) if contents.contains(PACKAGE_DESCRIPTION_SENTINEL) => {
          trace!(root = %current.display(), "Found package root");
          return Some(current);
        }
        Ok(_) => trace!(manifest = %manifest.display(), "Manifest does not mention PackageDescription; skipping"),
        Err(error) => trace!(manifest = %manifest.display(), %error, "Could not read manifest; skipping"),
      }
    }

    if !current.pop() {
      return None;
    }
  }
}
