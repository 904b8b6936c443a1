use std::path::Path;

use crate::error::{HashError, HashResult};

/// Calculates the blake3 checksum of a file, hex encoded.
pub fn calculate_checksum<P: AsRef<Path>>(file_path: P) -> HashResult<String> {
    let file_path = file_path.as_ref();
    let mut hasher = blake3::Hasher::new();
    hasher
        .update_mmap(file_path)
        .map_err(|source| HashError::ReadFailed {
            path: file_path.to_path_buf(),
            source,
        })?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Verifies the checksum of a file against an expected hex value,
/// case-insensitively.
pub fn verify_checksum<P: AsRef<Path>>(file_path: P, expected: &str) -> HashResult<bool> {
    let actual = calculate_checksum(file_path)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}
