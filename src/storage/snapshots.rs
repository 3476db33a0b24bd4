//! Baseline snapshot files. Layout:
//!
//! ```text
//! {root}/{customer_id}/{site_folder_id}/{custid}{nn}[-{k}].html
//! ```
//!
//! Folder ids and per-page counters live in `index.json` documents at the
//! customer and site-folder levels. Writers take an advisory file lock on the
//! level they mutate, so concurrent workers of one site serialize on the
//! folder index.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt snapshot index: {0}")]
    BadIndex(#[from] serde_json::Error),
}

fn one() -> u32 {
    1
}

/// `{customer_id}/index.json`: which folder each site lives in.
#[derive(Debug, Serialize, Deserialize)]
struct CustomerIndex {
    #[serde(default = "one")]
    next_folder: u32,
    #[serde(default)]
    sites: BTreeMap<String, u32>,
}

impl Default for CustomerIndex {
    fn default() -> Self {
        CustomerIndex {
            next_folder: 1,
            sites: BTreeMap::new(),
        }
    }
}

/// `{customer_id}/{folder}/index.json`: page numbers and revision counters.
#[derive(Debug, Serialize, Deserialize)]
struct FolderIndex {
    #[serde(default = "one")]
    next_page: u32,
    #[serde(default)]
    pages: BTreeMap<String, PageEntry>,
}

impl Default for FolderIndex {
    fn default() -> Self {
        FolderIndex {
            next_page: 1,
            pages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PageEntry {
    nn: u32,
    revisions: u32,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SnapshotStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one snapshot revision and return its path. Never overwrites an
    /// earlier revision.
    pub fn store(
        &self,
        customer_id: i64,
        site_id: i64,
        url: &str,
        normalized_text: &str,
    ) -> Result<PathBuf, SnapshotError> {
        let customer_dir = self.root.join(customer_id.to_string());
        std::fs::create_dir_all(&customer_dir)?;

        let folder_id = {
            let _lock = IndexLock::acquire(&customer_dir)?;
            let mut index: CustomerIndex = read_index(&customer_dir)?;
            let key = site_id.to_string();
            match index.sites.get(&key) {
                Some(id) => *id,
                None => {
                    let id = index.next_folder;
                    index.next_folder += 1;
                    index.sites.insert(key, id);
                    write_index(&customer_dir, &index)?;
                    id
                }
            }
        };

        let folder_dir = customer_dir.join(folder_id.to_string());
        std::fs::create_dir_all(&folder_dir)?;

        let _lock = IndexLock::acquire(&folder_dir)?;
        let mut index: FolderIndex = read_index(&folder_dir)?;
        let (nn, revision) = match index.pages.get_mut(url) {
            Some(entry) => {
                let revision = entry.revisions;
                entry.revisions += 1;
                (entry.nn, revision)
            }
            None => {
                let nn = index.next_page;
                index.next_page += 1;
                index.pages.insert(
                    url.to_string(),
                    PageEntry { nn, revisions: 1 },
                );
                (nn, 0)
            }
        };

        let file_name = if revision == 0 {
            format!("{customer_id}{nn}.html")
        } else {
            format!("{customer_id}{nn}-{revision}.html")
        };
        let path = folder_dir.join(file_name);
        std::fs::write(&path, normalized_text)?;
        write_index(&folder_dir, &index)?;

        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<String, SnapshotError> {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Held for the duration of an index mutation. The advisory lock releases
/// when the file handle drops.
struct IndexLock {
    _file: File,
}

impl IndexLock {
    fn acquire(dir: &Path) -> Result<Self, SnapshotError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join("index.lock"))?;
        file.lock_exclusive()?;
        Ok(IndexLock { _file: file })
    }
}

fn read_index<T: Default + for<'de> Deserialize<'de>>(dir: &Path) -> Result<T, SnapshotError> {
    let path = dir.join("index.json");
    match File::open(&path) {
        Ok(mut file) => {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            Ok(serde_json::from_str(&raw)?)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_index<T: Serialize>(dir: &Path, index: &T) -> Result<(), SnapshotError> {
    let path = dir.join("index.json");
    let mut file = File::create(&path)?;
    file.write_all(serde_json::to_string_pretty(index)?.as_bytes())?;
    Ok(())
}
