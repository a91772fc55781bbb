//! Filesystem bridge
//!
//! Each plugin sees only its own directory under `<root>/<plugin_id>`. Paths
//! from the context must be relative and made of plain components; anything
//! that resolves outside the plugin directory (including through symlinks) is
//! refused as a permission denial.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::protocol::BridgeFailure;
use crate::manifest::Permission;

#[derive(Debug, Clone)]
pub struct FsBridge {
    root: PathBuf,
}

impl FsBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sandbox_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    pub async fn read(&self, plugin_id: &str, path: &str) -> Result<Vec<u8>, BridgeFailure> {
        let target = self.existing(plugin_id, path, Permission::ReadFiles).await?;
        fs::read(&target).await.map_err(io_failure)
    }

    pub async fn write(&self, plugin_id: &str, path: &str, data: &[u8]) -> Result<(), BridgeFailure> {
        let sandbox = self.ensure_sandbox(plugin_id).await?;
        let target = sandbox.join(relative(plugin_id, path, Permission::WriteFiles)?);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(io_failure)?;
            let parent = fs::canonicalize(parent).await.map_err(io_failure)?;
            if !parent.starts_with(&sandbox) {
                return Err(escape(plugin_id, path, Permission::WriteFiles));
            }
        }
        if fs::symlink_metadata(&target)
            .await
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            return Err(escape(plugin_id, path, Permission::WriteFiles));
        }

        fs::write(&target, data).await.map_err(io_failure)?;
        debug!(plugin_id = %plugin_id, bytes = data.len(), "Plugin file written");
        Ok(())
    }

    pub async fn delete(&self, plugin_id: &str, path: &str) -> Result<(), BridgeFailure> {
        let target = self.existing(plugin_id, path, Permission::WriteFiles).await?;
        fs::remove_file(&target).await.map_err(io_failure)
    }

    /// File and directory names directly under `path`, sorted
    pub async fn list(&self, plugin_id: &str, path: &str) -> Result<Vec<String>, BridgeFailure> {
        let dir = if path.is_empty() || path == "." {
            self.ensure_sandbox(plugin_id).await?
        } else {
            self.existing(plugin_id, path, Permission::ReadFiles).await?
        };

        let mut entries = fs::read_dir(&dir).await.map_err(io_failure)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_failure)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn ensure_sandbox(&self, plugin_id: &str) -> Result<PathBuf, BridgeFailure> {
        let dir = self.sandbox_dir(plugin_id);
        fs::create_dir_all(&dir).await.map_err(io_failure)?;
        fs::canonicalize(&dir).await.map_err(io_failure)
    }

    /// Canonical path of an existing entry, which must stay inside the sandbox
    async fn existing(
        &self,
        plugin_id: &str,
        path: &str,
        permission: Permission,
    ) -> Result<PathBuf, BridgeFailure> {
        let sandbox = self.ensure_sandbox(plugin_id).await?;
        let target = sandbox.join(relative(plugin_id, path, permission)?);
        let resolved = fs::canonicalize(&target).await.map_err(io_failure)?;
        if resolved.starts_with(&sandbox) {
            Ok(resolved)
        } else {
            Err(escape(plugin_id, path, permission))
        }
    }
}

fn relative<'a>(
    plugin_id: &str,
    path: &'a str,
    permission: Permission,
) -> Result<&'a Path, BridgeFailure> {
    let candidate = Path::new(path);
    let plain = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(candidate)
    } else {
        Err(escape(plugin_id, path, permission))
    }
}

fn escape(plugin_id: &str, path: &str, permission: Permission) -> BridgeFailure {
    warn!(plugin_id = %plugin_id, path = %path, "Plugin path escapes its directory");
    BridgeFailure::outside(permission, path)
}

fn io_failure(e: std::io::Error) -> BridgeFailure {
    match e.kind() {
        ErrorKind::NotFound => BridgeFailure::NotFound,
        // OS messages can carry host paths.
        _ => BridgeFailure::failed("file operation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FsBridge::new(dir.path());

        bridge.write("p", "notes/today.txt", b"hello").await.unwrap();
        assert_eq!(bridge.read("p", "notes/today.txt").await.unwrap(), b"hello");
        assert_eq!(bridge.list("p", "").await.unwrap(), vec!["notes"]);
        assert_eq!(bridge.list("p", "notes").await.unwrap(), vec!["today.txt"]);

        bridge.delete("p", "notes/today.txt").await.unwrap();
        assert_eq!(
            bridge.read("p", "notes/today.txt").await,
            Err(BridgeFailure::NotFound)
        );
    }

    #[tokio::test]
    async fn test_plugins_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FsBridge::new(dir.path());
        bridge.write("a", "secret", b"x").await.unwrap();
        assert_eq!(bridge.read("b", "secret").await, Err(BridgeFailure::NotFound));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FsBridge::new(dir.path());
        bridge.write("b", "secret", b"x").await.unwrap();

        for path in ["../b/secret", "/etc/passwd", "./secret", "", "a/../../b/secret"] {
            assert_eq!(
                bridge.read("a", path).await,
                Err(BridgeFailure::outside(Permission::ReadFiles, path)),
                "{path} accepted"
            );
        }
        assert_eq!(
            bridge.write("a", "../b/secret", b"y").await,
            Err(BridgeFailure::outside(Permission::WriteFiles, "../b/secret"))
        );
        assert_eq!(bridge.read("b", "secret").await.unwrap(), b"x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("host.txt"), b"host").unwrap();

        let bridge = FsBridge::new(dir.path());
        let sandbox = bridge.sandbox_dir("p");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.join("link")).unwrap();

        assert!(matches!(
            bridge.read("p", "link/host.txt").await,
            Err(BridgeFailure::PermissionDenied {
                permission: Permission::ReadFiles,
                path: Some(_),
            })
        ));
        assert!(matches!(
            bridge.write("p", "link/new.txt", b"x").await,
            Err(BridgeFailure::PermissionDenied {
                permission: Permission::WriteFiles,
                path: Some(_),
            })
        ));
        assert!(!outside.path().join("new.txt").exists());
    }
}
