//! On-disk persistence of node documents.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::config::PathsConfig;
use crate::document::model::{ConfigDocument, MalformedDocument};
use crate::registry::{Node, NodeId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize document for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed document {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl StorageError {
    pub fn malformed(path: PathBuf, err: MalformedDocument) -> Self {
        StorageError::Malformed {
            path,
            reason: err.0,
        }
    }
}

/// Maps node ids to their document and access log paths.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_dir: PathBuf,
    log_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            config_dir: paths.config_dir.clone(),
            log_dir: paths.log_dir.clone(),
        }
    }

    pub fn config_path(&self, node_id: NodeId) -> PathBuf {
        self.config_dir.join(format!("config_{node_id}.json"))
    }

    pub fn access_log_path(&self, node_id: NodeId) -> PathBuf {
        self.log_dir.join(format!("access_{node_id}.log"))
    }

    pub fn exists(&self, node_id: NodeId) -> bool {
        self.config_path(node_id).is_file()
    }

    /// Read the document for `node_id` if one exists on disk.
    pub fn read(&self, node_id: NodeId) -> Result<Option<ConfigDocument>, StorageError> {
        let path = self.config_path(node_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Parse { path, source })
    }

    /// Read the document for `node`, generating and persisting the default
    /// one on first use.
    pub fn load(&self, node: &Node) -> Result<ConfigDocument, StorageError> {
        if let Some(doc) = self.read(node.id)? {
            return Ok(doc);
        }

        let doc = ConfigDocument::generate(node, &self.access_log_path(node.id));
        self.save(node.id, &doc)?;
        tracing::info!(
            node = node.id,
            path = %self.config_path(node.id).display(),
            "Generated default node document"
        );
        Ok(doc)
    }

    /// Take the node's document lock, blocking until any other holder in
    /// this or another process releases it.
    ///
    /// Callers doing a read-modify-write hold the returned guard across the
    /// whole sequence. Lock files live next to the documents.
    pub fn lock(&self, node_id: NodeId) -> Result<DocumentLock, StorageError> {
        self.ensure_config_dir()?;
        let path = self.config_dir.join(format!("config_{node_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        DocumentLock::acquire(file).map_err(|source| StorageError::Io { path, source })
    }

    /// Persist `doc` through a uniquely named temporary sibling and a rename
    /// so a reader never observes a partial write.
    pub fn save(&self, node_id: NodeId, doc: &ConfigDocument) -> Result<(), StorageError> {
        let path = self.config_path(node_id);
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StorageError::Serialize {
            path: path.clone(),
            source,
        })?;
        self.ensure_config_dir()?;

        let tmp = tempfile::Builder::new()
            .prefix(&format!("config_{node_id}."))
            .suffix(".json.tmp")
            .tempfile_in(&self.config_dir)
            .map_err(|source| StorageError::Io {
                path: self.config_dir.clone(),
                source,
            })?;
        write_synced(tmp.as_file(), &bytes).map_err(|source| StorageError::Io {
            path: tmp.path().to_path_buf(),
            source,
        })?;
        // Dropping the temp file on a failed persist removes it.
        tmp.persist(&path).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        tracing::debug!(node = node_id, path = %path.display(), "Node document saved");
        Ok(())
    }

    fn ensure_config_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.config_dir).map_err(|source| StorageError::Io {
            path: self.config_dir.clone(),
            source,
        })
    }
}

/// Exclusive advisory lock on one node's document, released on drop.
pub struct DocumentLock {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl DocumentLock {
    #[cfg(unix)]
    fn acquire(file: File) -> io::Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        Ok(Self { _flock: flock })
    }

    #[cfg(not(unix))]
    fn acquire(file: File) -> io::Result<Self> {
        Ok(Self { _file: file })
    }
}

fn write_synced(mut file: &File, bytes: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o644))?;
    }
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> ConfigStore {
        ConfigStore::new(&PathsConfig {
            config_dir: dir.join("etc"),
            log_dir: dir.join("log"),
            pid_dir: dir.join("run"),
        })
    }

    fn node() -> Node {
        Node {
            id: 7,
            name: "edge-7".into(),
            address: "127.0.0.1".into(),
            port: 12345,
            protocol: "vless".into(),
            api_port: 54321,
            is_connected: false,
            last_checked: None,
        }
    }

    #[test]
    fn test_paths_follow_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.config_path(7).ends_with("etc/config_7.json"));
        assert!(store.access_log_path(7).ends_with("log/access_7.log"));
    }

    #[test]
    fn test_load_creates_default_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read(7).unwrap().is_none());

        let doc = store.load(&node()).unwrap();
        assert!(store.exists(7));
        assert!(doc.clients().is_empty());
        assert_eq!(store.read(7).unwrap(), Some(doc));
    }

    #[test]
    fn test_save_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut doc = store.load(&node()).unwrap();
        doc.insert_client("abc").unwrap();
        store.save(7, &doc).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path().join("etc"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["config_7.json".to_string()]);
        assert!(store.read(7).unwrap().unwrap().contains_client("abc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_document_lock_excludes_second_holder() {
        use nix::fcntl::{Flock, FlockArg};

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let held = store.lock(7).unwrap();

        let other = OpenOptions::new()
            .write(true)
            .open(dir.path().join("etc/config_7.lock"))
            .unwrap();
        let other = match Flock::lock(other, FlockArg::LockExclusiveNonblock) {
            Ok(_) => panic!("second exclusive lock must not be granted"),
            Err((file, _)) => file,
        };

        drop(held);
        assert!(Flock::lock(other, FlockArg::LockExclusiveNonblock).is_ok());
        assert!(store.lock(8).is_ok());
    }

    #[test]
    fn test_unparseable_document_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(store.config_path(7), b"{ not json").unwrap();

        assert!(matches!(store.load(&node()), Err(StorageError::Parse { .. })));
    }
}
