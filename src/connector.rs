//! Source connectors.
//!
//! A [`Connector`] enumerates and streams bytes from a source namespace.
//! [`LocalConnector`] is the in-tree reference implementation over a root
//! directory, with glob selectors and a deterministic enumeration order.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{ConnectorErrorKind, EngineError, Result};
use crate::types::Resource;

/// A typed source of resources.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name for logging.
    fn name(&self) -> &str;

    /// Enumerate resources matching the glob selectors, in a stable order.
    async fn list(&self, selectors: &[String]) -> Result<Vec<Resource>>;

    /// Read the full payload of a resource.
    async fn open(&self, resource: &Resource) -> Result<Vec<u8>>;

    /// Refresh size/etag/modified metadata for a resource.
    async fn info(&self, resource: &Resource) -> Result<Resource>;
}

/// Guess a normalized mime type from a file extension.
pub fn mime_for_path(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("md") | Some("markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("jsonl") | Some("ndjson") => "application/x-ndjson",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Filesystem connector rooted at a directory.
///
/// Selectors are glob patterns relative to the root (`**/*.csv`). Matched
/// files are returned sorted by relative path, so runs over identical trees
/// enumerate identically.
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    /// Create a connector over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_globset(selectors: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for selector in selectors {
            let glob = Glob::new(selector).map_err(|e| {
                EngineError::connector(
                    ConnectorErrorKind::InvalidSelector,
                    format!("invalid selector {selector:?}: {e}"),
                )
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| {
            EngineError::connector(
                ConnectorErrorKind::InvalidSelector,
                format!("invalid selector set: {e}"),
            )
        })
    }

    fn resource_for(&self, absolute: &Path, relative: &Path) -> Resource {
        let metadata = std::fs::metadata(absolute).ok();
        let modified_at = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        Resource {
            uri: format!("file://{}", absolute.display()),
            name: relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime: mime_for_path(relative),
            size_bytes: metadata.as_ref().map(|m| m.len()),
            etag_or_hash: None,
            modified_at,
        }
    }

    fn path_for(&self, resource: &Resource) -> PathBuf {
        PathBuf::from(
            resource
                .uri
                .strip_prefix("file://")
                .unwrap_or(&resource.uri),
        )
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn name(&self) -> &str {
        "local"
    }

    async fn list(&self, selectors: &[String]) -> Result<Vec<Resource>> {
        let globset = Self::build_globset(selectors)?;
        let mut matches: Vec<(PathBuf, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                EngineError::connector(
                    ConnectorErrorKind::Transient,
                    format!("walk failed under {}: {e}", self.root.display()),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_path_buf();
            if globset.is_match(&relative) {
                matches.push((entry.path().to_path_buf(), relative));
            }
        }
        matches.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(matches
            .iter()
            .map(|(abs, rel)| self.resource_for(abs, rel))
            .collect())
    }

    async fn open(&self, resource: &Resource) -> Result<Vec<u8>> {
        let path = self.path_for(resource);
        tokio::fs::read(&path).await.map_err(|e| {
            let kind = match e.kind() {
                std::io::ErrorKind::NotFound => ConnectorErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ConnectorErrorKind::Permission,
                _ => ConnectorErrorKind::Transient,
            };
            EngineError::connector(kind, format!("open failed for {}: {e}", resource.uri))
        })
    }

    async fn info(&self, resource: &Resource) -> Result<Resource> {
        let path = self.path_for(resource);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            EngineError::connector(
                ConnectorErrorKind::NotFound,
                format!("stat failed for {}: {e}", resource.uri),
            )
        })?;
        let mut refreshed = resource.clone();
        refreshed.size_bytes = Some(metadata.len());
        refreshed.modified_at = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, LocalConnector) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.csv"), "id\n1\n").unwrap();
        let connector = LocalConnector::new(dir.path());
        (dir, connector)
    }

    #[tokio::test]
    async fn test_list_sorted_by_relative_path() {
        let (_dir, connector) = fixture();
        let resources = connector.list(&["**/*.txt".into()]).await.unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name, "a.txt");
        assert_eq!(resources[1].name, "b.txt");
        assert_eq!(resources[0].mime, "text/plain");
    }

    #[tokio::test]
    async fn test_list_matches_subdirectories() {
        let (_dir, connector) = fixture();
        let resources = connector.list(&["**/*.csv".into()]).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].mime, "text/csv");
    }

    #[tokio::test]
    async fn test_invalid_selector() {
        let (_dir, connector) = fixture();
        let err = connector.list(&["a[".into()]).await.unwrap_err();
        match err {
            EngineError::Connector { kind, .. } => {
                assert_eq!(kind, ConnectorErrorKind::InvalidSelector);
            }
            other => panic!("expected connector error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_roundtrip() {
        let (_dir, connector) = fixture();
        let resources = connector.list(&["a.txt".into()]).await.unwrap();
        let bytes = connector.open(&resources[0]).await.unwrap();
        assert_eq!(bytes, b"alpha");
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (_dir, connector) = fixture();
        let ghost = Resource {
            uri: "file:///nonexistent/ghost.txt".into(),
            name: "ghost.txt".into(),
            mime: "text/plain".into(),
            size_bytes: None,
            etag_or_hash: None,
            modified_at: None,
        };
        match connector.open(&ghost).await.unwrap_err() {
            EngineError::Connector { kind, message } => {
                assert_eq!(kind, ConnectorErrorKind::NotFound);
                assert!(message.contains("ghost.txt"));
            }
            other => panic!("expected connector error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_info_refreshes_size() {
        let (_dir, connector) = fixture();
        let resources = connector.list(&["a.txt".into()]).await.unwrap();
        let info = connector.info(&resources[0]).await.unwrap();
        assert_eq!(info.size_bytes, Some(5));
        assert!(info.modified_at.is_some());
    }

    #[test]
    fn test_mime_guesses() {
        assert_eq!(mime_for_path(Path::new("x.md")), "text/markdown");
        assert_eq!(mime_for_path(Path::new("x.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("x.bin")), "application/octet-stream");
    }
}
