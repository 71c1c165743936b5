//! Per-skill scoped storage.

use std::io;
use std::path::{Component, Path, PathBuf};

/// File access rooted at `{data_dir}/skills/{skill_name}`.
///
/// Relative paths are resolved under the root; paths that would escape it
/// are rejected with [`io::ErrorKind::InvalidInput`].
#[derive(Debug, Clone)]
pub struct FileSystemAccess {
    root: PathBuf,
}

impl FileSystemAccess {
    pub fn new(data_dir: impl AsRef<Path>, skill_name: &str) -> Self {
        Self {
            root: data_dir.as_ref().join("skills").join(skill_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `name` under the root.
    pub fn path(&self, name: impl AsRef<Path>) -> io::Result<PathBuf> {
        let name = name.as_ref();
        let escapes = name
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes skill storage: {}", name.display()),
            ));
        }
        Ok(self.root.join(name))
    }

    /// Creates the root directory if needed.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn exists(&self, name: impl AsRef<Path>) -> io::Result<bool> {
        tokio::fs::try_exists(self.path(name)?).await
    }

    pub async fn read(&self, name: impl AsRef<Path>) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path(name)?).await
    }

    pub async fn read_to_string(&self, name: impl AsRef<Path>) -> io::Result<String> {
        tokio::fs::read_to_string(self.path(name)?).await
    }

    /// Writes `contents`, creating parent directories.
    pub async fn write(&self, name: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> io::Result<()> {
        let path = self.path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await
    }

    pub async fn remove(&self, name: impl AsRef<Path>) -> io::Result<()> {
        tokio::fs::remove_file(self.path(name)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystemAccess::new(dir.path(), "timer");
        assert_eq!(fs.root(), dir.path().join("skills").join("timer"));

        fs.write("state/last.txt", "pasta").await.unwrap();
        assert!(fs.exists("state/last.txt").await.unwrap());
        assert_eq!(fs.read_to_string("state/last.txt").await.unwrap(), "pasta");

        fs.remove("state/last.txt").await.unwrap();
        assert!(!fs.exists("state/last.txt").await.unwrap());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        let fs = FileSystemAccess::new("/tmp/murmur", "timer");
        assert!(fs.path("../other/secret").is_err());
        assert!(fs.path("/etc/passwd").is_err());
        assert!(fs.path("./ok.txt").is_ok());
    }
}
