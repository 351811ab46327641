//! Archive and file helpers for materializing layers
//!
//! Everything here is blocking; callers run it on `spawn_blocking`.

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// File suffix of served layer archives
pub const ARCHIVE_SUFFIX: &str = "tar.gzip";

/// File name of the served archive for a digest
pub fn archive_name(digest: &str) -> String {
    format!("{}.{}", digest, ARCHIVE_SUFFIX)
}

/// Write a gzip-compressed tar of `src_dir` to `dest`, returning its size
///
/// Symlinks are archived as links, never followed, since layer trees
/// routinely point outside themselves.
pub fn tar_gzip_dir(src_dir: &Path, dest: &Path) -> io::Result<u64> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir)?;

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(fs::metadata(dest)?.len())
}

/// Copy a file and fsync the copy, returning its size
pub fn copy_file(src: &Path, dest: &Path) -> io::Result<u64> {
    let copied = fs::copy(src, dest)?;
    File::open(dest)?.sync_all()?;
    Ok(copied)
}

/// Hex sha256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Total size of every regular file under `root`
pub fn dir_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}
