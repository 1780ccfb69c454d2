// src/resolver.rs
use crate::error::{EtudeError, EtudeResult};
use crate::http::HttpCode;
use arrayvec::ArrayString;
use memmap2::Mmap;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Maximum length of a resolved filesystem path.
pub const FILENAME_LEN: usize = 200;

const S_IROTH: u32 = 0o004;

/// Maps request URLs onto files below a document root.
#[derive(Debug, Clone)]
pub struct Resolver {
    doc_root: ArrayString<FILENAME_LEN>,
}

impl Resolver {
    pub fn new(doc_root: impl AsRef<Path>) -> EtudeResult<Self> {
        let root = doc_root.as_ref();
        let root = root
            .to_str()
            .ok_or_else(|| EtudeError::Config(format!("document root {root:?} is not UTF-8")))?;
        let root = match root.trim_end_matches('/') {
            "" if root.starts_with('/') => "/",
            trimmed => trimmed,
        };
        let doc_root = ArrayString::from(root).map_err(|_| {
            EtudeError::Config(format!(
                "document root is longer than {FILENAME_LEN} bytes"
            ))
        })?;
        Ok(Self { doc_root })
    }

    pub fn doc_root(&self) -> &str {
        &self.doc_root
    }

    /// Resolve `url` (which starts with `/`) and map the file it names.
    ///
    /// On failure the error is the outcome to answer with: `NoResource`,
    /// `ForbiddenRequest`, `BadRequest` (a directory) or `InternalError`.
    pub fn resolve(&self, url: &str) -> Result<MappedFile, HttpCode> {
        let url = url.split(['?', '#']).next().unwrap_or(url);
        if url.split('/').any(|segment| segment == "..") {
            tracing::debug!(url, "rejecting path outside document root");
            return Err(HttpCode::NoResource);
        }

        let mut path = ArrayString::<FILENAME_LEN>::new();
        let root = if self.doc_root.as_str() == "/" { "" } else { self.doc_root.as_str() };
        if path.try_push_str(root).is_err() || path.try_push_str(url).is_err() {
            tracing::warn!(url, "resolved path exceeds {FILENAME_LEN} bytes");
            return Err(HttpCode::InternalError);
        }

        let meta = match fs::metadata(path.as_str()) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "stat failed");
                return Err(HttpCode::NoResource);
            }
        };
        let mode = meta.permissions().mode();
        if mode & S_IROTH == 0 {
            return Err(HttpCode::ForbiddenRequest);
        }
        if meta.is_dir() {
            return Err(HttpCode::BadRequest);
        }

        let file = File::open(path.as_str()).map_err(|e| {
            tracing::warn!(path = %path, error = %e, "open failed");
            HttpCode::InternalError
        })?;

        let map = if meta.len() == 0 {
            None
        } else {
            // SAFETY: the map is read-only and private to this connection. A file
            // truncated underneath us can still fault, the same as for any mmap
            // based file server.
            let map = unsafe { Mmap::map(&file) }.map_err(|e| {
                tracing::warn!(path = %path, error = %e, "mmap failed");
                HttpCode::InternalError
            })?;
            Some(map)
        };

        Ok(MappedFile {
            path,
            meta: FileMeta {
                size: meta.len(),
                mode,
            },
            map,
        })
    }
}

/// Metadata captured when the file was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub mode: u32,
}

/// A read-only mapping of a resolved file. Dropping it unmaps the file.
pub struct MappedFile {
    path: ArrayString<FILENAME_LEN>,
    meta: FileMeta,
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn meta(&self) -> FileMeta {
        self.meta
    }

    /// The file contents. Empty files are never mapped.
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.map.is_some() {
            tracing::trace!(path = %self.path, len = self.len(), "unmapping file");
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("meta", &self.meta)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use tempfile::TempDir;

    fn site() -> (TempDir, Resolver) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        for (name, mode) in [("index.html", 0o644), ("empty.txt", 0o644), ("docs", 0o755)] {
            fs::set_permissions(dir.path().join(name), Permissions::from_mode(mode)).unwrap();
        }
        let resolver = Resolver::new(dir.path()).unwrap();
        (dir, resolver)
    }

    #[test]
    fn maps_existing_file() {
        let (_dir, resolver) = site();
        let file = resolver.resolve("/index.html").unwrap();
        assert_eq!(file.bytes(), b"<h1>home</h1>");
        assert_eq!(file.meta().size, 13);
        assert!(file.path().ends_with("/index.html"));
    }

    #[test]
    fn query_string_is_not_part_of_the_path() {
        let (_dir, resolver) = site();
        assert!(resolver.resolve("/index.html?v=2").is_ok());
    }

    #[test]
    fn empty_file_is_served_without_mapping() {
        let (_dir, resolver) = site();
        let file = resolver.resolve("/empty.txt").unwrap();
        assert!(file.is_empty());
    }

    #[test]
    fn decision_table() {
        let (dir, resolver) = site();
        assert_eq!(resolver.resolve("/missing.html").unwrap_err(), HttpCode::NoResource);
        assert_eq!(resolver.resolve("/docs").unwrap_err(), HttpCode::BadRequest);
        assert_eq!(
            resolver.resolve("/../index.html").unwrap_err(),
            HttpCode::NoResource
        );

        let secret = dir.path().join("secret.txt");
        fs::write(&secret, "s").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o640)).unwrap();
        assert_eq!(
            resolver.resolve("/secret.txt").unwrap_err(),
            HttpCode::ForbiddenRequest
        );
    }

    #[test]
    fn overlong_path_is_internal_error() {
        let (_dir, resolver) = site();
        let url = format!("/{}", "a".repeat(FILENAME_LEN));
        assert_eq!(resolver.resolve(&url).unwrap_err(), HttpCode::InternalError);
    }

    #[test]
    fn trailing_slash_on_root_is_ignored() {
        let resolver = Resolver::new("/srv/www/").unwrap();
        assert_eq!(resolver.doc_root(), "/srv/www");
        assert_eq!(Resolver::new("/").unwrap().doc_root(), "/");
    }
}
