//! Toolchain model and host-toolchain discovery.
//!
//! Discovery is intentionally shallow: an explicit bin directory is validated
//! as-is, otherwise `$PATH` and a handful of conventional locations are
//! probed for a `swift` executable. Full toolchain management is the host's
//! concern; the core only needs a usable `swift` binary.

use std::path::{Path, PathBuf};

use tracing::trace;

/// A toolchain, identified by the directory holding its executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
  bin_dir: PathBuf,
}

impl Toolchain {
  pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
    Self { bin_dir: bin_dir.into() }
  }

  pub fn bin_dir(&self) -> &Path {
    &self.bin_dir
  }

  /// Path to the `swift` driver.
  pub fn swift(&self) -> PathBuf {
    self.bin_dir.join("swift")
  }

  /// Path to the `swiftc` compiler front door.
  pub fn swiftc(&self) -> PathBuf {
    self.bin_dir.join("swiftc")
  }

  fn is_usable(&self) -> bool {
    self.swift().is_file()
  }
}

/// Registry resolving the host toolchain.
#[derive(Debug, Clone, Default)]
pub struct ToolchainRegistry {
  host: Option<Toolchain>,
}

impl ToolchainRegistry {
  /// Registry with an explicit toolchain. The bin directory is validated;
  /// an unusable directory yields a registry with no host toolchain.
  pub fn with_toolchain(toolchain: Toolchain) -> Self {
    if toolchain.is_usable() {
      Self { host: Some(toolchain) }
    } else {
      trace!(bin_dir = %toolchain.bin_dir().display(), "Provided toolchain has no swift executable");
      Self { host: None }
    }
  }

  /// Discover the host toolchain from `$PATH`, then conventional locations.
  pub fn discover() -> Self {
    let host = discover_swift_bin_dir().map(Toolchain::new);
    if let Some(ref toolchain) = host {
      trace!(bin_dir = %toolchain.bin_dir().display(), "Discovered host toolchain");
    }
    Self { host }
  }

  pub fn host_toolchain(&self) -> Option<&Toolchain> {
    self.host.as_ref()
  }
}

fn discover_swift_bin_dir() -> Option<PathBuf> {
  if let Some(path) = std::env::var_os("PATH") {
    for dir in std::env::split_paths(&path) {
      if dir.join("swift").is_file() {
        return Some(dir);
      }
    }
  }

  for candidate in ["/usr/bin", "/usr/local/bin", "/opt/swift/usr/bin"] {
    let dir = PathBuf::from(candidate);
    if dir.join("swift").is_file() {
      return Some(dir);
    }
  }

  None
}
