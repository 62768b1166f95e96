use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::ErrorKind;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let normalized: PathBuf = normal_segments(relative)?.into_iter().collect();
        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// Returns the directory entries under `relative`, or the entry itself when
    /// it names a regular file.
    pub async fn list(&self, relative: &str) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            let name = target
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(vec![self.entry(&target, name, &metadata)?]);
        }

        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(self.entry(&entry.path(), name, &metadata)?);
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    fn entry(
        &self,
        path: &Path,
        name: String,
        metadata: &Metadata,
    ) -> Result<FileEntry, StorageError> {
        let relative_path = path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let modified = metadata
            .modified()
            .ok()
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .map(format_timestamp);

        Ok(FileEntry {
            name,
            path: relative_path,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified,
        })
    }

    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        if target == self.root {
            return Err(StorageError::InvalidPath);
        }
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }
}

/// Reports whether `path` currently exists as a directory.
pub async fn is_existing_dir(path: &Path) -> bool {
    matches!(fs::metadata(path).await, Ok(metadata) if metadata.is_dir())
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}

/// Canonical logical form of `relative`, e.g. `/a//./b.txt` becomes `/a/b.txt`.
///
/// Uses the same component rules as path resolution, so two spellings that
/// land on the same file always share one key.
pub fn normalize_logical_path(relative: &str) -> Result<String, StorageError> {
    let segments = normal_segments(relative)?
        .into_iter()
        .map(|segment| segment.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    Ok(format!("/{}", segments.join("/")))
}

fn normal_segments(relative: &str) -> Result<Vec<&OsStr>, StorageError> {
    let trimmed = relative.trim_start_matches(['/', '\\']);
    let mut segments = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => segments.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError, normalize_logical_path};
    use tempfile::tempdir;

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_path_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        let link_path = root.join("link");
        symlink(&outside, &link_path).expect("symlink");

        let storage = Storage::new(root);
        let result = storage.resolve_path_checked("link", false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn resolve_path_rejects_parent_components() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().to_path_buf());
        let result = storage.resolve_path_checked("/a/../../etc/passwd", true).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn aliased_spellings_share_key_and_destination() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().to_path_buf());
        for alias in ["/a/b.txt", "a/b.txt", "/a//b.txt", "/a/./b.txt", "//a/.//b.txt"] {
            assert_eq!(normalize_logical_path(alias).expect("normalize"), "/a/b.txt");
            assert_eq!(
                storage.resolve_path_checked(alias, true).await.expect("resolve"),
                temp.path().join("a/b.txt")
            );
        }
        assert_eq!(normalize_logical_path("/./").expect("normalize"), "/");
        assert!(matches!(
            normalize_logical_path("/a/../b.txt"),
            Err(StorageError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn list_orders_directories_first() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("docs/zeta")).expect("create dir");
        std::fs::write(root.join("docs/alpha.txt"), b"12345").expect("write file");

        let storage = Storage::new(root);
        let entries = storage.list("/docs").await.expect("list");
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha.txt"]);
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[1].path, "docs/alpha.txt");

        let single = storage.list("/docs/alpha.txt").await.expect("list file");
        assert_eq!(single.len(), 1);
        assert!(!single[0].is_dir);
    }

    #[tokio::test]
    async fn delete_refuses_storage_root() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().to_path_buf());
        let result = storage.delete_path("/").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }
}
