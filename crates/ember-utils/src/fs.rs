use std::{
    fs,
    io::{Read, Write},
    path::Path,
};

use crate::error::{FileSystemError, FileSystemResult};

/// Removes the specified file or directory safely.
///
/// If the path does not exist, this function returns `Ok(())` without
/// error. Directories are removed recursively.
pub fn safe_remove<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(());
    }

    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|source| FileSystemError::Remove {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates a directory structure if it doesn't exist.
///
/// If the path exists but is not a directory, this function returns an
/// error.
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).map_err(|source| FileSystemError::CreateDirectory {
            path: path.to_path_buf(),
            source,
        })?;
    } else if !path.is_dir() {
        return Err(FileSystemError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Clears the read-only bit on `path` if the file exists.
///
/// Repeat runs overwrite previously cached files; a read-only
/// destination would turn that into an access-denied error.
pub fn clear_readonly<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();

    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };

    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions).map_err(|source| {
            FileSystemError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }

    Ok(())
}

/// Moves `from` to `to`, falling back to copy + remove when the rename
/// crosses a filesystem boundary.
///
/// The destination's parent directory is created and any existing
/// destination file is made writable first.
pub fn atomic_move<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> FileSystemResult<()> {
    let from = from.as_ref();
    let to = to.as_ref();

    if let Some(parent) = to.parent() {
        ensure_dir_exists(parent)?;
    }
    clear_readonly(to)?;

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to).map_err(|source| FileSystemError::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source,
            })?;
            safe_remove(from)
        }
    }
}

/// Copies `from` to `to`, creating the destination's parent directory
/// and clearing a stale read-only bit first.
pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> FileSystemResult<u64> {
    let from = from.as_ref();
    let to = to.as_ref();

    if let Some(parent) = to.parent() {
        ensure_dir_exists(parent)?;
    }
    clear_readonly(to)?;

    fs::copy(from, to).map_err(|source| FileSystemError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Reads an entire file into a byte vector.
pub fn read_file<P: AsRef<Path>>(path: P) -> FileSystemResult<Vec<u8>> {
    let path = path.as_ref();
    let mut file = fs::File::open(path).map_err(|source| FileSystemError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|source| FileSystemError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buffer)
}

/// Writes `data` to `path`, creating parent directories as needed.
pub fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> FileSystemResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    let mut file = fs::File::create(path).map_err(|source| FileSystemError::WriteFile {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(data)
        .map_err(|source| FileSystemError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
}
