use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};
use crate::pipeline::copy_with_cancel;
use crate::storage::StorageBackend;

/// Object storage on a local or mounted filesystem.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        fs::create_dir_all(&root_path)?;
        Ok(Self {
            root: fs::canonicalize(&root_path)?,
        })
    }

    /// Reject storage keys that could escape the root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(VaultError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(VaultError::InvalidFormat(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(VaultError::InvalidFormat(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write beside the target and rename so readers never see a partial file.
    fn write_atomic(&self, path: &Path, reader: &mut dyn Read, cancel: &CancelToken) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            copy_with_cancel(reader, &mut writer, cancel)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    // Skip in-flight atomic-write temp files.
                    if !key.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp")) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Failures of the store itself become `StorageUnavailable`. Cancellation
/// and key errors pass through.
fn unavailable(op: &str, key: &str, err: VaultError) -> VaultError {
    match err {
        VaultError::Io(e) => VaultError::StorageUnavailable(format!("local {op} {key}: {e}")),
        other => other,
    }
}

impl StorageBackend for LocalBackend {
    fn put_file(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()> {
        let path = self.resolve(key)?;
        let mut reader = BufReader::new(fs::File::open(source)?);
        self.write_atomic(&path, &mut reader, cancel)
            .map_err(|e| unavailable("put", key, e))
    }

    fn get_to_file(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<bool> {
        let path = self.resolve(key)?;
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(unavailable("get", key, e.into())),
        };
        let mut reader = BufReader::new(file);
        let mut writer = BufWriter::new(fs::File::create(dest)?);
        copy_with_cancel(&mut reader, &mut writer, cancel)
            .map_err(|e| unavailable("get", key, e))?;
        writer.flush()?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable("delete", key, e.into())),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable("stat", key, e.into())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk only the directory part of the prefix, then filter.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.resolve(&prefix[..idx])?,
            None => self.root.clone(),
        };
        let mut keys = Vec::new();
        self.list_recursive(&dir, &mut keys)
            .map_err(|e| unavailable("list", prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable("rename", to, e.into()))?;
        }
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::ArtifactMissing(from.to_string()))
            }
            Err(e) => Err(unavailable("rename", from, e.into())),
        }
    }
}
