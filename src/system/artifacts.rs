use crate::error::Error;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub type DynArtifacts = Arc<dyn ArtifactStore + Send + Sync>;

/// Path-addressed storage for rendered configuration and certificate material.
#[async_trait::async_trait]
pub trait ArtifactStore {
    /// Read a file, or `None` if it doesn't exist.
    async fn read(&self, path: &Path) -> Result<Option<String>, Error>;

    /// Write a file, creating parent directories. `mode` is applied when the file is created.
    async fn write(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<(), Error>;

    /// The permission bits of a file, or `None` if it doesn't exist or the platform has none.
    async fn permissions(&self, path: &Path) -> Result<Option<u32>, Error>;

    /// Atomically replace `to` with `from`.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    /// Remove a file. Returns `false` if it was already absent.
    async fn remove(&self, path: &Path) -> Result<bool, Error>;

    /// Point `link` at `target`, replacing any existing link.
    async fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error>;

    /// Remove a link. Returns `false` if it was already absent.
    async fn unlink(&self, link: &Path) -> Result<bool, Error>;

    /// The target of `link`, or `None` if there is no such link.
    async fn link_target(&self, link: &Path) -> Result<Option<PathBuf>, Error>;

    /// The entries of a directory; empty if it doesn't exist.
    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, Error>;

    /// Remove an empty directory. Returns `false` if it was already absent.
    async fn remove_dir(&self, dir: &Path) -> Result<bool, Error>;
}

/// Artifacts on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsArtifacts;

fn absent_ok<T>(res: std::io::Result<T>, absent: T) -> Result<T, Error> {
    match res {
        Ok(v) => Ok(v),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(absent),
        Err(err) => Err(Error::IO(err)),
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifacts {
    async fn read(&self, path: &Path) -> Result<Option<String>, Error> {
        absent_ok(fs::read_to_string(path).await.map(Some), None)
    }

    async fn write(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        if let Some(mode) = mode {
            options.mode(mode);
        }
        let mut file = options.open(path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            // An existing file keeps its old mode on open, so set it explicitly.
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn permissions(&self, path: &Path) -> Result<Option<u32>, Error> {
        use std::os::unix::fs::PermissionsExt;
        let metadata = absent_ok(fs::metadata(path).await.map(Some), None)?;
        Ok(metadata.map(|m| m.permissions().mode() & 0o7777))
    }

    #[cfg(not(unix))]
    async fn permissions(&self, _path: &Path) -> Result<Option<u32>, Error> {
        Ok(None)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        Ok(fs::rename(from, to).await?)
    }

    async fn remove(&self, path: &Path) -> Result<bool, Error> {
        absent_ok(fs::remove_file(path).await.map(|()| true), false)
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error> {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::symlink_metadata(link).await.is_ok() {
            fs::remove_file(link).await?;
        }
        #[cfg(unix)]
        fs::symlink(target, link).await?;
        #[cfg(not(unix))]
        fs::copy(target, link).await.map(|_| ())?;
        Ok(())
    }

    async fn unlink(&self, link: &Path) -> Result<bool, Error> {
        self.remove(link).await
    }

    async fn link_target(&self, link: &Path) -> Result<Option<PathBuf>, Error> {
        absent_ok(fs::read_link(link).await.map(Some), None)
    }

    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::IO(err)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    async fn remove_dir(&self, dir: &Path) -> Result<bool, Error> {
        absent_ok(fs::remove_dir(dir).await.map(|()| true), false)
    }
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, (String, Option<u32>)>,
    links: BTreeMap<PathBuf, PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

impl Tree {
    fn add_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }
}

/// An in-memory artifact tree.
#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    tree: Mutex<Tree>,
}

impl MemoryArtifacts {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous read, usable from inside a scripted [`CommandRunner`][super::CommandRunner].
    pub fn contents(&self, path: &Path) -> Option<String> {
        self.tree().files.get(path).map(|(c, _)| c.clone())
    }

    pub fn mode(&self, path: &Path) -> Option<u32> {
        self.tree().files.get(path).and_then(|(_, m)| *m)
    }

    pub fn is_linked(&self, link: &Path) -> bool {
        self.tree().links.contains_key(link)
    }

    /// Every file path currently stored.
    pub fn files(&self) -> Vec<PathBuf> {
        self.tree().files.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn read(&self, path: &Path) -> Result<Option<String>, Error> {
        Ok(self.contents(path))
    }

    async fn write(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<(), Error> {
        let mut tree = self.tree();
        tree.add_parents(path);
        let mode = mode.or_else(|| tree.files.get(path).and_then(|(_, m)| *m));
        tree.files
            .insert(path.to_path_buf(), (contents.to_string(), mode));
        Ok(())
    }

    async fn permissions(&self, path: &Path) -> Result<Option<u32>, Error> {
        Ok(self.mode(path))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let mut tree = self.tree();
        let file = tree.files.remove(from).ok_or_else(|| {
            Error::IO(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} does not exist", from.display()),
            ))
        })?;
        tree.add_parents(to);
        tree.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.tree().files.remove(path).is_some())
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error> {
        let mut tree = self.tree();
        tree.add_parents(link);
        tree.links.insert(link.to_path_buf(), target.to_path_buf());
        Ok(())
    }

    async fn unlink(&self, link: &Path) -> Result<bool, Error> {
        Ok(self.tree().links.remove(link).is_some())
    }

    async fn link_target(&self, link: &Path) -> Result<Option<PathBuf>, Error> {
        Ok(self.tree().links.get(link).cloned())
    }

    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let tree = self.tree();
        let children = tree
            .files
            .keys()
            .chain(tree.links.keys())
            .chain(tree.dirs.iter())
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }

    async fn remove_dir(&self, dir: &Path) -> Result<bool, Error> {
        let mut tree = self.tree();
        let occupied = tree
            .files
            .keys()
            .chain(tree.links.keys())
            .any(|p| p.starts_with(dir));
        if occupied {
            return Err(Error::IO(std::io::Error::new(
                ErrorKind::Other,
                format!("{} is not empty", dir.display()),
            )));
        }
        let existed = tree.dirs.remove(dir);
        tree.dirs.retain(|d| !d.starts_with(dir));
        Ok(existed)
    }
}
