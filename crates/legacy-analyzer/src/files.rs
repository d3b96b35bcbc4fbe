//! Source discovery: .gitignore-respecting walk using the `ignore` crate.

use std::path::{Path, PathBuf};

use analysis_coordination::SourceFile;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use thiserror::Error;

/// Extensions treated as analyzable source.
const SOURCE_EXTENSIONS: &[&str] = &[
    "java", "go", "py", "rs", "c", "h", "cpp", "hpp", "cs", "js", "ts", "rb", "php", "kt",
    "scala", "cbl", "cob", "pl", "sql", "vb",
];

#[derive(Debug, Error)]
pub enum SourceLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid UTF-8 text")]
    NotText { path: PathBuf },
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand `paths` into a sorted, de-duplicated list of source files.
///
/// Directories are walked with hidden entries and .gitignore'd paths
/// skipped. Files named explicitly are kept even without a known extension.
pub fn discover(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        let walker = WalkBuilder::new(root).hidden(true).git_ignore(true).build();
        for entry in walker.flatten() {
            let path = entry.path();
            if path.is_file() && is_source_file(path) {
                files.push(path.to_path_buf());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Read `path` into a [`SourceFile`] named relative to `base` when possible.
pub async fn load_source(path: &Path, base: Option<&Path>) -> Result<SourceFile, SourceLoadError> {
    let io_err = |source| SourceLoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = tokio::fs::read(path).await.map_err(io_err)?;
    let modified: DateTime<Utc> = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map_err(io_err)?
        .into();
    let content = String::from_utf8(bytes).map_err(|_| SourceLoadError::NotText {
        path: path.to_path_buf(),
    })?;

    let name = base
        .and_then(|b| path.strip_prefix(b).ok())
        .filter(|rel| !rel.as_os_str().is_empty())
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    Ok(SourceFile::new(name, modified, content))
}
