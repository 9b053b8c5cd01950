use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use crate::link_source::Item;

/// Characters that are invalid in filenames on at least one common platform.
const DISALLOWED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const SUBSTITUTE: char = '_';
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Reading the response body failed mid-transfer.
    #[error("Transfer interrupted after {bytes_written} bytes: {source}")]
    Transfer {
        bytes_written: u64,
        source: io::Error,
    },

    /// The body ended at or below the minimum size, e.g. an error page
    /// served with a 200.
    #[error("Body too small: {bytes_written} bytes (need more than {min_size})")]
    Truncated { bytes_written: u64, min_size: u64 },

    /// Writing to local disk failed.
    #[error("Cannot write {path}: {source}")]
    Io { path: String, source: io::Error },
}

pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if DISALLOWED.contains(&c) { SUBSTITUTE } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct FileSink {
    dir: PathBuf,
    extension: String,
    min_size: u64,
}

impl FileSink {
    pub fn new<P: Into<PathBuf>>(dir: P, extension: &str, min_size: u64) -> Self {
        FileSink {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
            min_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// `<dir>/<no:03>_<title>.<ext>`
    pub fn destination_path(&self, item: &Item) -> PathBuf {
        self.dir.join(format!(
            "{:03}_{}.{}",
            item.no,
            sanitize_title(&item.title),
            self.extension
        ))
    }

    /// A file counts as present only above the minimum size; anything smaller
    /// is a leftover from an interrupted write.
    pub fn is_present(&self, path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.len() > self.min_size,
            Err(_) => false,
        }
    }

    pub fn existing_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|m| m.len())
    }

    /// Stream `body` into `<path>.part`, then rename it onto `path`. A body
    /// that would not pass [`FileSink::is_present`] is discarded.
    pub fn write(&self, path: &Path, body: &mut dyn Read) -> Result<u64, SinkError> {
        let part_path = part_path(path);
        let result = self.write_part(&part_path, body).and_then(|written| {
            if written <= self.min_size {
                return Err(SinkError::Truncated {
                    bytes_written: written,
                    min_size: self.min_size,
                });
            }
            fs::rename(&part_path, path)
                .map(|_| written)
                .map_err(|source| io_error(path, source))
        });

        if result.is_err() {
            if let Err(e) = fs::remove_file(&part_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove partial file {:?}: {}", part_path, e);
                }
            }
        }
        result
    }

    fn write_part(&self, part_path: &Path, body: &mut dyn Read) -> Result<u64, SinkError> {
        let mut file = File::create(part_path).map_err(|source| io_error(part_path, source))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;

        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(SinkError::Transfer {
                        bytes_written: written,
                        source,
                    })
                }
            };
            file.write_all(&buf[..n])
                .map_err(|source| io_error(part_path, source))?;
            written += n as u64;
        }

        file.sync_all().map_err(|source| io_error(part_path, source))?;
        debug!("Wrote {} bytes to {:?}", written, part_path);
        Ok(written)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn io_error(path: &Path, source: io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}
