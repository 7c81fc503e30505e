//! The file catalog: a durable mapping from filename to file metadata.
//!
//! Backs both the TCP transfer sessions and the HTTP surface; all catalog
//! mutation in the process goes through this type, which serializes every
//! read-modify-write behind one mutex and persists the whole map before the
//! mutating call returns.  The on-disk form is a single JSON object keyed by
//! filename, rewritten through a temp file and an atomic rename so a crash
//! never leaves a torn index behind.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dlog;
use crate::protocol::format_size;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CatalogError {
    Io(io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "catalog io error: {e}"),
            CatalogError::Serde(e) => write!(f, "catalog serialization error: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<io::Error> for CatalogError {
    fn from(e: io::Error) -> Self {
        CatalogError::Io(e)
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One tracked file. This is the persisted shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    /// Seconds since the Unix epoch, fractional.
    pub upload_time: f64,
    #[serde(default)]
    pub download_count: u64,
}

/// One row of a catalog listing, as serialized into `FILELIST` replies and
/// the `/api/files` response.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub filename: String,
    pub size: u64,
    pub upload_time: f64,
    pub download_count: u64,
    pub size_formatted: String,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

struct CatalogShared {
    storage_dir: PathBuf,
    index_path: PathBuf,
    records: Mutex<HashMap<String, FileRecord>>,
}

/// Handle to the shared catalog. Cheap to clone; all clones observe one map.
#[derive(Clone)]
pub struct Catalog {
    shared: Arc<CatalogShared>,
}

impl Catalog {
    /// Open the catalog, creating the storage directory if needed and loading
    /// any existing index. A missing or corrupt index loads as empty.
    pub fn open(storage_dir: &Path, index_path: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(storage_dir)?;
        let records = match fs::read_to_string(index_path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                dlog!("catalog: ignoring corrupt index {}: {e}", index_path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            shared: Arc::new(CatalogShared {
                storage_dir: storage_dir.to_path_buf(),
                index_path: index_path.to_path_buf(),
                records: Mutex::new(records),
            }),
        })
    }

    /// The flat directory holding the physical files.
    pub fn storage_dir(&self) -> &Path {
        &self.shared.storage_dir
    }

    /// Storage path for a sanitized filename.
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.shared.storage_dir.join(filename)
    }

    /// List the catalog, newest upload first.
    ///
    /// Reconciles the storage directory against the record map first: any
    /// physical file without a record gets one synthesized (size probed from
    /// disk, upload time = now), and the reconciled map is persisted before
    /// the listing is returned. Records whose physical file has vanished are
    /// kept in the map but not listed.
    pub fn list(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut records = self.lock_records();
        let mut entries = Vec::new();
        let mut discovered = 0usize;

        for dirent in fs::read_dir(&self.shared.storage_dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let filename = match dirent.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let record = match records.get(&filename) {
                Some(record) => record.clone(),
                None => {
                    let record = FileRecord {
                        filename: filename.clone(),
                        size: dirent.metadata()?.len(),
                        upload_time: now_epoch(),
                        download_count: 0,
                    };
                    records.insert(filename.clone(), record.clone());
                    discovered += 1;
                    record
                }
            };
            entries.push(CatalogEntry {
                filename: record.filename,
                size: record.size,
                upload_time: record.upload_time,
                download_count: record.download_count,
                size_formatted: format_size(record.size),
            });
        }

        if discovered > 0 {
            dlog!("catalog: discovered {discovered} untracked file(s)");
            self.persist(&records)?;
        }

        entries.sort_by(|a, b| b.upload_time.total_cmp(&a.upload_time));
        Ok(entries)
    }

    /// Create or refresh the record for an uploaded file. The download count
    /// of any prior record with the same name is preserved.
    pub fn upsert_on_upload(&self, filename: &str, size: u64) -> Result<(), CatalogError> {
        let mut records = self.lock_records();
        let download_count = records.get(filename).map_or(0, |r| r.download_count);
        records.insert(
            filename.to_string(),
            FileRecord {
                filename: filename.to_string(),
                size,
                upload_time: now_epoch(),
                download_count,
            },
        );
        self.persist(&records)
    }

    /// Increment the download counter for `filename`; no-op if untracked.
    pub fn record_download(&self, filename: &str) -> Result<(), CatalogError> {
        let mut records = self.lock_records();
        match records.get_mut(filename) {
            Some(record) => {
                record.download_count += 1;
                self.persist(&records)
            }
            None => Ok(()),
        }
    }

    /// Remove the physical file and its record as one logical operation.
    ///
    /// Returns `false` — never an error — if the file does not exist or
    /// cannot be removed.
    pub fn delete(&self, filename: &str) -> bool {
        let mut records = self.lock_records();
        let path = self.shared.storage_dir.join(filename);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                dlog!("catalog: failed to remove {}: {e}", path.display());
            }
            return false;
        }
        records.remove(filename);
        match self.persist(&records) {
            Ok(()) => true,
            Err(e) => {
                dlog!("catalog: failed to persist after deleting {filename}: {e}");
                false
            }
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, FileRecord>> {
        self.shared.records.lock().unwrap()
    }

    /// Rewrite the full index through a temp file and an atomic rename.
    fn persist(&self, records: &HashMap<String, FileRecord>) -> Result<(), CatalogError> {
        let data = serde_json::to_string(records)?;
        let tmp = self.shared.index_path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.shared.index_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Catalog rooted in a per-invocation temp directory so parallel tests
    /// don't collide.
    fn test_catalog() -> (Catalog, PathBuf) {
        let pid = std::process::id();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("depot-catalog-{pid}-{ts}"));
        let catalog = Catalog::open(&dir.join("uploads"), &dir.join("file_info.json")).unwrap();
        (catalog, dir)
    }

    fn put_file(catalog: &Catalog, name: &str, contents: &[u8]) {
        fs::write(catalog.file_path(name), contents).unwrap();
    }

    #[test]
    fn upsert_then_list_round_trips() {
        let (catalog, _dir) = test_catalog();
        put_file(&catalog, "a.txt", b"hello");
        catalog.upsert_on_upload("a.txt", 5).unwrap();

        let entries = catalog.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "a.txt");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].download_count, 0);
        assert_eq!(entries[0].size_formatted, "5 B");
        assert!(entries[0].upload_time > 0.0);
    }

    #[test]
    fn reupload_preserves_download_count() {
        let (catalog, _dir) = test_catalog();
        put_file(&catalog, "a.txt", b"v1");
        catalog.upsert_on_upload("a.txt", 2).unwrap();
        catalog.record_download("a.txt").unwrap();
        catalog.record_download("a.txt").unwrap();

        put_file(&catalog, "a.txt", b"v2 longer");
        catalog.upsert_on_upload("a.txt", 9).unwrap();

        let entries = catalog.list().unwrap();
        assert_eq!(entries[0].size, 9);
        assert_eq!(entries[0].download_count, 2);
    }

    #[test]
    fn record_download_on_untracked_name_is_a_noop() {
        let (catalog, _dir) = test_catalog();
        catalog.record_download("ghost.bin").unwrap();
        assert!(catalog.list().unwrap().is_empty());
    }

    #[test]
    fn list_synthesizes_records_for_untracked_files() {
        let (catalog, _dir) = test_catalog();
        put_file(&catalog, "dropped.bin", &[0u8; 42]);

        let entries = catalog.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "dropped.bin");
        assert_eq!(entries[0].size, 42);
        assert_eq!(entries[0].download_count, 0);
    }

    #[test]
    fn list_orders_by_upload_time_descending() {
        let (catalog, _dir) = test_catalog();
        for name in ["first", "second", "third"] {
            put_file(&catalog, name, b"x");
            catalog.upsert_on_upload(name, 1).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let names: Vec<String> = catalog
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.filename)
            .collect();
        assert_eq!(names, ["third", "second", "first"]);
    }

    #[test]
    fn delete_removes_file_and_record() {
        let (catalog, _dir) = test_catalog();
        put_file(&catalog, "a.txt", b"hello");
        catalog.upsert_on_upload("a.txt", 5).unwrap();

        assert!(catalog.delete("a.txt"));
        assert!(!catalog.file_path("a.txt").exists());
        assert!(catalog.list().unwrap().is_empty());

        // A second delete reports failure, it does not error.
        assert!(!catalog.delete("a.txt"));
    }

    #[test]
    fn index_survives_reopen() {
        let (catalog, dir) = test_catalog();
        put_file(&catalog, "keep.dat", b"0123456789");
        catalog.upsert_on_upload("keep.dat", 10).unwrap();
        catalog.record_download("keep.dat").unwrap();
        drop(catalog);

        let reopened = Catalog::open(&dir.join("uploads"), &dir.join("file_info.json")).unwrap();
        let entries = reopened.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].download_count, 1);
        assert_eq!(entries[0].size, 10);
    }

    #[test]
    fn corrupt_index_loads_as_empty() {
        let (catalog, dir) = test_catalog();
        put_file(&catalog, "a.txt", b"x");
        catalog.upsert_on_upload("a.txt", 1).unwrap();
        drop(catalog);

        fs::write(dir.join("file_info.json"), b"{not json").unwrap();
        let reopened = Catalog::open(&dir.join("uploads"), &dir.join("file_info.json")).unwrap();
        // The physical file is still there, so it is re-discovered.
        let entries = reopened.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].download_count, 0);
    }
}
