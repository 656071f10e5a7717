//! Test fixture generation.
//!
//! Fixtures live in a [`tempfile::TempDir`] scoped to the probe: the scratch
//! area disappears when the probe is done, whatever the outcome.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use md5::{Digest, Md5};

/// MD5 of empty content; a zero-byte upload must hash to this on both sides.
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// A probe-scoped scratch directory.
pub struct Scratch {
    dir: tempfile::TempDir,
}

impl Scratch {
    pub fn new() -> Result<Self> {
        let dir = tempfile::TempDir::new().context("create probe scratch dir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create a fixture of `size` bytes with a repeating A/B/C/D 1 KiB
    /// pattern, so corruption is easy to localize by eye in hex dumps.
    pub fn create_file(&self, name: &str, size: u64) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        let mut file = File::create(&path).with_context(|| format!("create fixture {name}"))?;

        let mut pattern = Vec::with_capacity(4096);
        for byte in [b'A', b'B', b'C', b'D'] {
            pattern.extend(std::iter::repeat_n(byte, 1024));
        }

        let mut remaining = size as usize;
        while remaining > 0 {
            let n = remaining.min(pattern.len());
            file.write_all(&pattern[..n])?;
            remaining -= n;
        }
        file.flush()?;
        Ok(path)
    }
}

/// Streaming MD5 of a file, 1 MiB chunks.
pub fn md5_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// MD5 of a byte slice, lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}
