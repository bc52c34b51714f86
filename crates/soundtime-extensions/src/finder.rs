//! Extension discovery over the configured search paths.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::Stream;

use crate::error::ExtensionError;
use crate::manifest::Manifest;

/// Scans search paths for extension directories.
#[derive(Debug, Clone)]
pub struct ExtensionFinder {
    search_paths: Vec<PathBuf>,
    max_retries: u32,
}

impl ExtensionFinder {
    pub fn new(search_paths: Vec<PathBuf>, max_retries: u32) -> Self {
        Self {
            search_paths,
            max_retries,
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Lazily yield every extension manifest found under the search paths.
    ///
    /// A search path that cannot be read is created and the whole scan
    /// starts over, at most `max_retries` times, after which a
    /// [`ExtensionError::Discovery`] is yielded and the stream ends.
    /// Manifests yielded before a restart are not yielded again.
    pub fn find_extensions(&self) -> impl Stream<Item = Result<Manifest, ExtensionError>> + Send + 'static {
        let search_paths = self.search_paths.clone();
        let max_retries = self.max_retries;

        async_stream::stream! {
            let mut seen: HashSet<PathBuf> = HashSet::new();
            let mut restarts = 0u32;

            'scan: loop {
                for search_path in &search_paths {
                    match tokio::fs::metadata(search_path).await {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => {
                            tracing::warn!(path = %search_path.display(), "extension search path is not a directory");
                            continue;
                        }
                        Err(e) => {
                            if restarts >= max_retries {
                                yield Err(ExtensionError::Discovery(format!(
                                    "search path {} unavailable after {restarts} retries: {e}",
                                    search_path.display()
                                )));
                                return;
                            }
                            restarts += 1;
                            tracing::warn!(
                                path = %search_path.display(),
                                error = %e,
                                "extension search path doesn't exist, creating it"
                            );
                            if let Err(e) = tokio::fs::create_dir_all(search_path).await {
                                tracing::error!(path = %search_path.display(), error = %e, "failed to create search path");
                            }
                            continue 'scan;
                        }
                    }

                    let dirs = match list_subdirectories(search_path).await {
                        Ok(dirs) => dirs,
                        Err(e) => {
                            tracing::warn!(path = %search_path.display(), error = %e, "failed to read search path");
                            continue;
                        }
                    };

                    for dir in dirs {
                        if seen.contains(&dir) {
                            continue;
                        }
                        match Manifest::load(&dir).await {
                            Ok(Some(manifest)) => {
                                tracing::debug!(
                                    extension = %manifest.package_name,
                                    path = %dir.display(),
                                    "found extension"
                                );
                                seen.insert(dir);
                                yield Ok(manifest);
                            }
                            Ok(None) => {
                                tracing::trace!(path = %dir.display(), "package is not an extension");
                            }
                            Err(ExtensionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                tracing::warn!(path = %dir.display(), error = %e, "skipping invalid extension manifest");
                            }
                        }
                    }
                }
                break;
            }
        }
    }
}

/// Subdirectories of `path`, sorted by file name.
async fn list_subdirectories(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        match tokio::fs::metadata(&entry_path).await {
            Ok(meta) if meta.is_dir() => dirs.push(entry_path),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %entry_path.display(), error = %e, "skipping unreadable entry");
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

// ─── Tests ──────────────────────────────────────────────────────────
