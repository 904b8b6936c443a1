use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use ember_utils::fs::{clear_readonly, ensure_dir_exists};
use tracing::debug;

use crate::{
    error::DownloadError,
    types::{CancelFlag, Progress},
};

const CHUNK_SIZE: usize = 256 * 1024;

/// Copies a local file with the same progress and cancellation
/// contract as a download.
pub fn copy_local(
    src: &Path,
    dest: &Path,
    on_progress: &dyn Fn(Progress),
    cancel: &CancelFlag,
) -> Result<u64, DownloadError> {
    if !src.is_file() {
        return Err(DownloadError::SourceMissing {
            path: src.display().to_string(),
        });
    }

    if let Some(parent) = dest.parent() {
        ensure_dir_exists(parent).map_err(|e| {
            DownloadError::Io(std::io::Error::other(e.to_string()))
        })?;
    }
    clear_readonly(dest).map_err(|e| DownloadError::Io(std::io::Error::other(e.to_string())))?;

    let total = src.metadata()?.len();
    on_progress(Progress::Starting { total });

    let mut reader = File::open(src)?;
    let mut writer = File::create(dest)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut current = 0u64;

    loop {
        if cancel.is_canceled() {
            debug!(src = %src.display(), "copy canceled");
            return Err(DownloadError::Canceled {
                name: src.display().to_string(),
            });
        }

        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        current += read as u64;
        on_progress(Progress::Chunk { current, total });
    }

    writer.flush()?;
    on_progress(Progress::Complete { total: current });
    Ok(current)
}
