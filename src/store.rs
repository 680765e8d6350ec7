use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WavereqError;
use crate::router::RouteGroup;

const SCHEMA_VERSION: u32 = 1;

/// Durable form of a submitted download: the resolved routes with their
/// payload keys plus everything the engine needs to re-run it after a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub service: String,
    pub groups: Vec<RouteGroup>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub bulk: bool,
    pub merge: bool,
    pub content_type: String,
    pub filename: String,
}

/// Filesystem-backed store with three collections: the user record (auth
/// token), request records and payload blobs. Blob ids and request ids are
/// autoincremented through counter files.
///
/// Blob files have three observable states that the engine relies on:
/// absent (never fetched), zero length (fetched, no data) and non-empty.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: Utf8PathBuf,
}

impl BlobStore {
    pub fn open(root: Option<Utf8PathBuf>) -> Result<Self, WavereqError> {
        let root = match root {
            Some(root) => root,
            None => default_root()?,
        };
        let store = Self { root };
        store.migrate()?;
        Ok(store)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn migrate(&self) -> Result<(), WavereqError> {
        let version_path = self.root.join("version");
        let version = match fs::read_to_string(version_path.as_std_path()) {
            Ok(content) => content
                .trim()
                .parse::<u32>()
                .map_err(|_| WavereqError::Storage(format!("corrupt version file {version_path}")))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(WavereqError::Storage(err.to_string())),
        };

        if version > SCHEMA_VERSION {
            return Err(WavereqError::Storage(format!(
                "store at {} has schema version {version}, this build supports {SCHEMA_VERSION}",
                self.root
            )));
        }

        if version < SCHEMA_VERSION {
            debug!("initializing store at {} (schema v{SCHEMA_VERSION})", self.root);
            for dir in ["user", "requests", "blobs"] {
                fs::create_dir_all(self.root.join(dir).as_std_path())
                    .map_err(|err| WavereqError::Storage(err.to_string()))?;
            }
            write_bytes_atomic(&version_path, SCHEMA_VERSION.to_string().as_bytes())?;
        }

        Ok(())
    }

    fn next_id(&self, counter: &str) -> Result<u64, WavereqError> {
        let path = self.root.join(counter);
        let current = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content
                .trim()
                .parse::<u64>()
                .map_err(|_| WavereqError::Storage(format!("corrupt counter file {path}")))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(WavereqError::Storage(err.to_string())),
        };
        let next = current + 1;
        write_bytes_atomic(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Reserve a blob id without creating the file. The absent file marks the
    /// payload as not yet fetched.
    pub fn reserve_blob(&self) -> Result<u64, WavereqError> {
        self.next_id("blobs.seq")
    }

    fn blob_path(&self, id: u64) -> Utf8PathBuf {
        self.root.join("blobs").join(format!("{id}.bin"))
    }

    /// Write-once: a blob that already exists is left untouched so a
    /// re-driven download cannot clobber data fetched earlier.
    pub fn put_blob(&self, id: u64, content: &[u8]) -> Result<(), WavereqError> {
        let path = self.blob_path(id);
        if path.as_std_path().exists() {
            debug!("blob {id} already stored, keeping existing content");
            return Ok(());
        }
        write_bytes_atomic(&path, content)
    }

    pub fn get_blob(&self, id: u64) -> Result<Option<Vec<u8>>, WavereqError> {
        match fs::read(self.blob_path(id).as_std_path()) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    /// Payload length without reading the payload. `None` while pending.
    pub fn blob_len(&self, id: u64) -> Result<Option<u64>, WavereqError> {
        match fs::metadata(self.blob_path(id).as_std_path()) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    pub fn has_blob(&self, id: u64) -> bool {
        self.blob_path(id).as_std_path().exists()
    }

    pub fn delete_blob(&self, id: u64) -> Result<(), WavereqError> {
        match fs::remove_file(self.blob_path(id).as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    fn request_path(&self, id: u64) -> Utf8PathBuf {
        self.root.join("requests").join(format!("{id}.json"))
    }

    /// Assigns a fresh id and persists the record.
    pub fn add_request(&self, record: &mut PersistedRequest) -> Result<u64, WavereqError> {
        let id = self.next_id("requests.seq")?;
        record.id = Some(id);
        self.put_request(record)?;
        Ok(id)
    }

    pub fn put_request(&self, record: &PersistedRequest) -> Result<(), WavereqError> {
        let id = record
            .id
            .ok_or_else(|| WavereqError::Storage("request record has no id".to_string()))?;
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| WavereqError::Storage(err.to_string()))?;
        write_bytes_atomic(&self.request_path(id), &content)
    }

    pub fn get_request(&self, id: u64) -> Result<Option<PersistedRequest>, WavereqError> {
        match fs::read_to_string(self.request_path(id).as_std_path()) {
            Ok(content) => {
                let record = serde_json::from_str(&content)
                    .map_err(|err| WavereqError::Storage(err.to_string()))?;
                Ok(Some(record))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    pub fn delete_request(&self, id: u64) -> Result<(), WavereqError> {
        match fs::remove_file(self.request_path(id).as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    /// All persisted requests, ordered by id.
    pub fn list_requests(&self) -> Result<Vec<PersistedRequest>, WavereqError> {
        let requests_root = self.root.join("requests");
        let mut ids = Vec::new();
        let entries = fs::read_dir(requests_root.as_std_path())
            .map_err(|err| WavereqError::Storage(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| WavereqError::Storage(err.to_string()))?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            ids.push(id);
        }
        ids.sort_unstable();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_request(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn token_path(&self) -> Utf8PathBuf {
        self.root.join("user").join("token")
    }

    pub fn put_token(&self, token: &str) -> Result<(), WavereqError> {
        write_bytes_atomic(&self.token_path(), token.as_bytes())
    }

    pub fn get_token(&self) -> Result<Option<String>, WavereqError> {
        match fs::read_to_string(self.token_path().as_std_path()) {
            Ok(token) => Ok(Some(token)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }

    pub fn delete_token(&self) -> Result<(), WavereqError> {
        match fs::remove_file(self.token_path().as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WavereqError::Storage(err.to_string())),
        }
    }
}

fn default_root() -> Result<Utf8PathBuf, WavereqError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".local/share/wavereq")).ok()
        })
        .ok_or_else(|| WavereqError::Filesystem("unable to resolve data directory".to_string()))
}

fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), WavereqError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| WavereqError::Storage(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| WavereqError::Storage(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| WavereqError::Storage(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let store = BlobStore::open(Some(root)).unwrap();
        (dir, store)
    }

    #[test]
    fn ids_are_monotonic_per_collection() {
        let (_dir, store) = temp_store();
        assert_eq!(store.reserve_blob().unwrap(), 1);
        assert_eq!(store.reserve_blob().unwrap(), 2);

        let mut record = sample_request();
        assert_eq!(store.add_request(&mut record).unwrap(), 1);
        let mut record = sample_request();
        assert_eq!(store.add_request(&mut record).unwrap(), 2);
    }

    #[test]
    fn blobs_are_write_once() {
        let (_dir, store) = temp_store();
        let id = store.reserve_blob().unwrap();
        assert!(!store.has_blob(id));
        assert_eq!(store.get_blob(id).unwrap(), None);

        store.put_blob(id, b"first").unwrap();
        store.put_blob(id, b"second").unwrap();
        assert_eq!(store.get_blob(id).unwrap().unwrap(), b"first");

        // Zero-length blobs are stored and are distinct from absent ones.
        let empty = store.reserve_blob().unwrap();
        store.put_blob(empty, b"").unwrap();
        assert_eq!(store.get_blob(empty).unwrap().unwrap(), Vec::<u8>::new());

        store.delete_blob(id).unwrap();
        store.delete_blob(id).unwrap();
        assert_eq!(store.get_blob(id).unwrap(), None);
    }

    #[test]
    fn requests_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();

        let store = BlobStore::open(Some(root.clone())).unwrap();
        let mut record = sample_request();
        let id = store.add_request(&mut record).unwrap();
        drop(store);

        let store = BlobStore::open(Some(root)).unwrap();
        let records = store.list_requests().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, Some(id));
        assert_eq!(records[0].service, "dataselect");

        store.delete_request(id).unwrap();
        assert!(store.list_requests().unwrap().is_empty());
    }

    #[test]
    fn token_round_trip() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get_token().unwrap(), None);
        store.put_token("token-bytes").unwrap();
        assert_eq!(store.get_token().unwrap().as_deref(), Some("token-bytes"));
        store.delete_token().unwrap();
        assert_eq!(store.get_token().unwrap(), None);
    }

    fn sample_request() -> PersistedRequest {
        PersistedRequest {
            id: None,
            service: "dataselect".to_string(),
            groups: Vec::new(),
            options: BTreeMap::new(),
            bulk: false,
            merge: true,
            content_type: "application/vnd.fdsn.mseed".to_string(),
            filename: "data.mseed".to_string(),
        }
    }
}
