use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cellar_core::storage::{apply_mutations, BackendError, Mutation, StorageBackend, StoredValue};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::instrument;

/// File-backed storage backend: one JSON document per region under `root`.
///
/// Every commit rewrites the region's document through a temp file and an
/// atomic rename, so a crash mid-write leaves either the old or the new
/// document, never a mix of fields from both.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, region: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_region(region)))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegionDocument {
    entries: BTreeMap<String, StoredValue>,
}

impl StorageBackend for FileBackend {
    #[instrument(skip_all, fields(region = %region))]
    fn load(&self, region: &str) -> Result<BTreeMap<String, StoredValue>, BackendError> {
        Ok(read_document(&self.path_for(region), region)?.entries)
    }

    #[instrument(skip_all, fields(region = %region, mutations = mutations.len()))]
    fn commit(&self, region: &str, mutations: &[Mutation]) -> Result<(), BackendError> {
        reject_unencodable(mutations)?;
        let path = self.path_for(region);
        let mut document = read_document(&path, region)?;
        apply_mutations(&mut document.entries, mutations);

        if document.entries.is_empty() {
            return remove_document(&path);
        }
        write_document(&path, &document)
    }

    #[instrument(skip_all, fields(region = %region))]
    fn drop_region(&self, region: &str) -> Result<(), BackendError> {
        remove_document(&self.path_for(region))
    }
}

/// JSON cannot hold NaN or infinity; serde_json writes them as `null`, which
/// then fails to load.
fn reject_unencodable(mutations: &[Mutation]) -> Result<(), BackendError> {
    for mutation in mutations {
        if let Mutation::Put {
            key,
            value: StoredValue::Float(f),
        } = mutation
        {
            if !f.is_finite() {
                return Err(BackendError::Storage {
                    reason: format!("{key}: non-finite float cannot be stored"),
                });
            }
        }
    }
    Ok(())
}

fn write_document(path: &Path, document: &RegionDocument) -> Result<(), BackendError> {
    let parent = path.parent().ok_or_else(|| BackendError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(document).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_document(path: &Path, region: &str) -> Result<RegionDocument, BackendError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegionDocument::default())
        }
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    if buf.is_empty() {
        return Ok(RegionDocument::default());
    }
    serde_json::from_slice(&buf).map_err(|e| BackendError::Corrupt {
        region: region.to_string(),
        reason: e.to_string(),
    })
}

fn remove_document(path: &Path) -> Result<(), BackendError> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(storage_err(err)),
    }
}

fn sanitize_region(region: &str) -> String {
    URL_SAFE_NO_PAD.encode(region)
}

fn storage_err<E: ToString>(err: E) -> BackendError {
    BackendError::Storage {
        reason: err.to_string(),
    }
}
