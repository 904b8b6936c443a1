//! Container extraction.
//!
//! The decompressor itself is an opaque collaborator: the engine only
//! fixes the contract of pulling a container's ordered payload stream
//! out of a staged archive. The in-tree implementation understands
//! the plain concatenated stream layout, which is enough for layout
//! bundles and tests; embedding processes register a richer extractor
//! for their archive format.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use ember_core::{
    error::{EmberError, EmberResult, ErrorContext},
    manifest::{Container, Payload},
};
use ember_utils::fs::ensure_dir_exists;
use tracing::debug;

/// Pulls payloads out of a staged container.
pub trait ContainerExtractor: Send + Sync {
    /// Extracts `container`'s stream from the archive at `staged`.
    /// `stream` pairs each payload (in stream order) with its
    /// destination; `None` skips the entry.
    fn extract(
        &self,
        container: &Container,
        stream: &[(&Payload, Option<PathBuf>)],
        staged: &Path,
    ) -> EmberResult<()>;
}

/// Extractor for the concatenated stream layout: payloads packed
/// back to back in stream order, sized by the manifest.
pub struct StreamContainerExtractor;

impl ContainerExtractor for StreamContainerExtractor {
    fn extract(
        &self,
        container: &Container,
        stream: &[(&Payload, Option<PathBuf>)],
        staged: &Path,
    ) -> EmberResult<()> {
        let mut archive = File::open(staged)
            .with_context(|| format!("opening container '{}'", container.id))?;

        for (payload, destination) in stream {
            if payload.size == 0 {
                return Err(EmberError::Validation(format!(
                    "container '{}' streams payload '{}' without a size",
                    container.id, payload.key
                )));
            }

            match destination {
                Some(destination) => {
                    if let Some(parent) = destination.parent() {
                        ensure_dir_exists(parent)?;
                    }
                    let mut remaining = payload.size;
                    let mut out = File::create(destination).with_context(|| {
                        format!("creating '{}'", destination.display())
                    })?;
                    let mut buffer = [0u8; 64 * 1024];
                    while remaining > 0 {
                        let want = remaining.min(buffer.len() as u64) as usize;
                        archive
                            .read_exact(&mut buffer[..want])
                            .with_context(|| {
                                format!("reading container '{}'", container.id)
                            })?;
                        out.write_all(&buffer[..want]).with_context(|| {
                            format!("writing '{}'", destination.display())
                        })?;
                        remaining -= want as u64;
                    }
                    debug!(
                        container = %container.id,
                        payload = %payload.key,
                        "payload extracted"
                    );
                }
                None => {
                    archive
                        .seek(SeekFrom::Current(payload.size as i64))
                        .with_context(|| {
                            format!("seeking container '{}'", container.id)
                        })?;
                }
            }
        }

        Ok(())
    }
}
