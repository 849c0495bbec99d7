use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use crate::error::{Code, Error, Result};

/// A readable, seekable object body. Zip archives need both.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub dirs_only: bool,
    pub files_only: bool,
    pub with_size: bool,
}

/// An entry returned by [`ObjectBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    /// Directory relative to the backend root, `""` for the root itself.
    pub dir: String,
    pub name: String,
    pub size: i64,
    pub is_dir: bool,
}

/// Where partner drops live.
pub trait ObjectBackend: Send + Sync {
    /// Display form of the backend root.
    fn path(&self) -> &str;

    fn path_separator(&self) -> char;

    fn path_join(&self, parts: &[&str]) -> String {
        let sep = self.path_separator();
        parts
            .iter()
            .map(|p| p.trim_matches(sep))
            .filter(|p| !p.is_empty() && *p != ".")
            .collect::<Vec<_>>()
            .join(&sep.to_string())
    }

    /// Lists the direct children of `prefix`, sorted by name.
    fn list(&self, prefix: &str, opts: &ListOptions) -> Result<Vec<StorageObject>>;

    fn get(&self, dir: &str, name: &str) -> Result<Box<dyn ReadSeek>>;
}

/// A directory tree on the local filesystem.
pub struct LocalBackend {
    root: PathBuf,
    display: String,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let display = root.display().to_string();
        Self { root, display }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in relative.split(['/', std::path::MAIN_SEPARATOR]) {
            if !segment.is_empty() && segment != "." {
                path.push(segment);
            }
        }
        path
    }
}

impl ObjectBackend for LocalBackend {
    fn path(&self) -> &str {
        &self.display
    }

    fn path_separator(&self) -> char {
        '/'
    }

    fn list(&self, prefix: &str, opts: &ListOptions) -> Result<Vec<StorageObject>> {
        let target = self.resolve(prefix);
        let dir = self.path_join(&[prefix]);

        let entries = std::fs::read_dir(&target).map_err(|e| {
            Error::new("056ef1e1-e089-4905-ba27-bcaa2d937c64", Code::FailedPrecondition, "Failed to list directory.")
                .with_cause(e)
                .with_meta("path", target.display().to_string())
        })?;

        let mut objects = Vec::new();

        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let is_dir = file_type.is_dir();

            if (is_dir && opts.files_only) || (!is_dir && opts.dirs_only) {
                continue;
            }

            let size = if opts.with_size && !is_dir {
                let meta = entry.metadata().map_err(|e| {
                    Error::new("fb61be3c-a5df-4f65-964a-da2126dd6393", Code::FailedPrecondition, "Failed to get info of entry.")
                        .with_cause(e)
                })?;
                i64::try_from(meta.len()).unwrap_or(i64::MAX)
            } else {
                0
            };

            objects.push(StorageObject {
                dir: dir.clone(),
                name: entry.file_name().to_string_lossy().into_owned(),
                size,
                is_dir,
            });
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    fn get(&self, dir: &str, name: &str) -> Result<Box<dyn ReadSeek>> {
        let target = self.resolve(dir).join(name);
        let file = File::open(&target).map_err(|e| {
            Error::new("4686e736-1d9a-4218-be53-e53d6cd1bd0c", Code::FailedPrecondition, "Failed to open file.")
                .with_cause(e)
                .with_meta("path", target.display().to_string())
        })?;
        Ok(Box::new(file))
    }
}
