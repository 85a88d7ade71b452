use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use crc::{Crc, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

use crate::metadata_ext::PortableFileExt;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// A stable identity for a watched file that survives renames within the
/// same filesystem, so rotation does not look like a brand new file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileFingerprint {
    /// Device and inode on unix, volume serial and file index on Windows.
    DevInode(u64, u64),
    /// CRC of the first line, for filesystems where inodes are recycled
    /// aggressively or identity must survive copies.
    FirstLineChecksum(u64),
}

#[derive(Debug, Clone, Copy)]
pub enum FingerprintStrategy {
    DevInode,
    FirstLineChecksum { max_line_length: usize },
}

#[derive(Debug, Clone)]
pub struct Fingerprinter {
    pub strategy: FingerprintStrategy,
}

impl Fingerprinter {
    pub fn new(strategy: FingerprintStrategy) -> Self {
        Self { strategy }
    }

    pub fn fingerprint(&self, path: &Path) -> io::Result<FileFingerprint> {
        match self.strategy {
            FingerprintStrategy::DevInode => {
                let file = File::open(path)?;
                Ok(FileFingerprint::DevInode(
                    file.portable_dev()?,
                    file.portable_ino()?,
                ))
            }
            FingerprintStrategy::FirstLineChecksum { max_line_length } => {
                let mut buffer = vec![0u8; max_line_length];
                let file = File::open(path)?;
                read_first_line(file, b'\n', &mut buffer)?;
                Ok(FileFingerprint::FirstLineChecksum(CRC64.checksum(&buffer)))
            }
        }
    }
}

/// Fill `buf` with bytes up to and including the first `delim`, zeroing
/// the rest so equal first lines always produce equal checksums. Fails
/// with `UnexpectedEof` when the file ends before a delimiter; callers
/// treat that as "too small to fingerprint yet".
fn read_first_line(mut r: impl Read, delim: u8, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let read = match r.read(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF reached")),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if let Some(pos) = buf[..read].iter().position(|&c| c == delim) {
            for slot in &mut buf[(pos + 1)..] {
                *slot = 0;
            }
            return Ok(());
        }

        buf = &mut buf[read..];
    }
    Ok(())
}
