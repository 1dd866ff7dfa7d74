//! Reference set: one persisted embedding per label.
//!
//! Each identity lives in `<dir>/<label>_embedding.npy`. The in-memory set is
//! always what a fresh directory scan produces; writers persist first, then
//! rescan and swap the whole set.

use crate::pipeline::{embed_best_face, EnrollError, FaceEmbedder, RegionDetector};
use crate::types::{Embedding, Reference};
use image::RgbImage;
use ndarray::{Array1, ArrayD};
use ndarray_npy::{ReadNpyError, ReadNpyExt, WriteNpyError, WriteNpyExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const EMBEDDING_SUFFIX: &str = "_embedding.npy";

/// Image extensions accepted for uploaded reference photos.
pub const UPLOAD_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

const MAX_LABEL_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("name is required")]
    EmptyLabel,
    #[error("invalid name {0:?}: use letters, digits, spaces, '-' or '_'")]
    InvalidLabel(String),
    #[error("no file uploaded")]
    MissingFile,
    #[error("unsupported file type {0:?}; allowed: png, jpg, jpeg")]
    DisallowedExtension(String),
}

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error(transparent)]
    Invalid(#[from] UploadError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("no reference named {0:?}")]
    NotFound(String),
    #[error("embedding for {label:?} has {actual} values, existing references have {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("cannot encode embedding: {0}")]
    Encode(#[from] WriteNpyError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReferenceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Trim a label and check it is safe to embed in a file name.
pub fn validate_label(label: &str) -> Result<&str, UploadError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(UploadError::EmptyLabel);
    }
    let allowed = |c: char| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.');
    if label.len() > MAX_LABEL_LEN || label.starts_with('.') || !label.chars().all(allowed) {
        return Err(UploadError::InvalidLabel(label.to_string()));
    }
    Ok(label)
}

/// Validate an upload request before anything touches disk.
///
/// Returns the trimmed label.
pub fn validate_upload<'a>(label: &'a str, file_name: Option<&str>) -> Result<&'a str, UploadError> {
    let label = validate_label(label)?;
    let file_name = file_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(UploadError::MissingFile)?;

    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
        return Err(UploadError::DisallowedExtension(extension));
    }
    Ok(label)
}

/// Reduce a client-supplied file name to a safe basename.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']);
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Path of the embedding file for `label`.
pub fn embedding_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("{label}{EMBEDDING_SUFFIX}"))
}

/// Label encoded in an embedding file name, if it is one.
fn label_of(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(EMBEDDING_SUFFIX)
        .filter(|label| !label.is_empty() && !label.starts_with('.'))
}

/// Read a float vector from an `.npy` file.
///
/// Accepts `f4` or `f8` data in either byte order and any shape with at most
/// one axis longer than 1, so `(512,)` and `(1, 512)` both load.
fn read_embedding(path: &Path) -> Result<Vec<f32>, ReadNpyError> {
    let open = || fs::File::open(path).map_err(ReadNpyError::from);
    let array = match ArrayD::<f32>::read_npy(open()?) {
        Ok(array) => array,
        Err(ReadNpyError::WrongDescriptor(_)) => ArrayD::<f64>::read_npy(open()?)?.mapv(|v| v as f32),
        Err(e) => return Err(e),
    };
    if array.shape().iter().filter(|&&d| d != 1).count() > 1 {
        return Err(ReadNpyError::WrongNdim(Some(1), array.ndim()));
    }
    Ok(array.iter().copied().collect())
}

/// Summary row for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceInfo {
    pub label: String,
    pub dim: usize,
}

/// Immutable label-ordered set of references.
#[derive(Debug, Default, Clone)]
pub struct ReferenceSet {
    entries: Vec<Reference>,
}

impl ReferenceSet {
    /// Scan `dir`, skipping anything that is not a well-formed embedding file.
    ///
    /// A missing directory yields an empty set. Entries are taken in label
    /// order; the first one fixes the dimension and later mismatches are dropped.
    pub fn load_dir(dir: &Path) -> Self {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "reference directory missing");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read reference directory");
                return Self::default();
            }
        };

        let mut candidates: Vec<(String, PathBuf)> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let label = label_of(&name)?.to_string();
                Some((label, entry.path()))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries: Vec<Reference> = Vec::with_capacity(candidates.len());
        for (label, path) in candidates {
            let values = match read_embedding(&path) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed embedding file");
                    continue;
                }
            };

            if values.is_empty() {
                tracing::warn!(path = %path.display(), "skipping empty embedding");
                continue;
            }
            if let Some(first) = entries.first() {
                if first.embedding.dim() != values.len() {
                    tracing::warn!(
                        label = %label,
                        dim = values.len(),
                        expected = first.embedding.dim(),
                        "skipping embedding with mismatched dimension"
                    );
                    continue;
                }
            }

            entries.push(Reference {
                label,
                embedding: Embedding::new(values),
            });
        }

        tracing::info!(dir = %dir.display(), count = entries.len(), "reference set loaded");
        Self { entries }
    }

    pub fn entries(&self) -> &[Reference] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Reference> {
        self.entries
            .binary_search_by(|r| r.label.as_str().cmp(label))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.label.clone()).collect()
    }

    pub fn info(&self) -> Vec<ReferenceInfo> {
        self.entries
            .iter()
            .map(|r| ReferenceInfo {
                label: r.label.clone(),
                dim: r.embedding.dim(),
            })
            .collect()
    }

    /// Dimension shared by every entry.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|r| r.embedding.dim())
    }
}

/// Directory-backed reference set with wholesale snapshot swaps.
pub struct ReferenceStore {
    dir: PathBuf,
    current: RwLock<Arc<ReferenceSet>>,
    /// Serializes persist-then-reload sequences.
    write_lock: Mutex<()>,
}

impl ReferenceStore {
    /// Open (creating if needed) the directory and load it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReferenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ReferenceError::io(&dir, e))?;
        let set = ReferenceSet::load_dir(&dir);
        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(set)),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current set. Holders keep their snapshot across later swaps.
    pub fn snapshot(&self) -> Arc<ReferenceSet> {
        Arc::clone(&self.current.read())
    }

    /// Rescan the directory and swap in the result.
    pub fn reload(&self) -> Arc<ReferenceSet> {
        let set = Arc::new(ReferenceSet::load_dir(&self.dir));
        *self.current.write() = Arc::clone(&set);
        set
    }

    pub fn list(&self) -> Vec<ReferenceInfo> {
        self.snapshot().info()
    }

    /// Enroll `label` from a photo: embed its best face, persist, reload.
    ///
    /// Nothing is written unless embedding succeeds.
    pub fn add<D, E>(
        &self,
        label: &str,
        image: &RgbImage,
        detector: &mut D,
        embedder: &mut E,
    ) -> Result<Arc<ReferenceSet>, ReferenceError>
    where
        D: RegionDetector + ?Sized,
        E: FaceEmbedder + ?Sized,
    {
        let label = validate_label(label)?;
        let embedding = embed_best_face(detector, embedder, image)?;
        self.insert_embedding(label, &embedding)
    }

    /// Persist an embedding for `label`, replacing any existing one.
    ///
    /// The embedding must match the dimension of the other references;
    /// replacing the only reference may change it.
    pub fn insert_embedding(
        &self,
        label: &str,
        embedding: &Embedding,
    ) -> Result<Arc<ReferenceSet>, ReferenceError> {
        let label = validate_label(label)?;
        let _guard = self.write_lock.lock();

        let current = self.snapshot();
        if let Some(expected) = current
            .entries()
            .iter()
            .find(|r| r.label != label)
            .map(|r| r.embedding.dim())
        {
            if expected != embedding.dim() {
                return Err(ReferenceError::DimensionMismatch {
                    label: label.to_string(),
                    expected,
                    actual: embedding.dim(),
                });
            }
        }

        let path = embedding_path(&self.dir, label);
        let tmp = self.dir.join(format!(".{label}{EMBEDDING_SUFFIX}.tmp"));
        let file = fs::File::create(&tmp).map_err(|e| ReferenceError::io(&tmp, e))?;
        if let Err(e) = Array1::from(embedding.values.clone()).write_npy(file) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(ReferenceError::io(&path, e));
        }

        tracing::info!(label, dim = embedding.dim(), path = %path.display(), "reference saved");
        Ok(self.reload())
    }

    /// Delete the embedding file for `label` and reload.
    pub fn remove(&self, label: &str) -> Result<Arc<ReferenceSet>, ReferenceError> {
        let label = validate_label(label)?;
        let _guard = self.write_lock.lock();

        let path = embedding_path(&self.dir, label);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ReferenceError::NotFound(label.to_string()));
            }
            Err(e) => return Err(ReferenceError::io(&path, e)),
        }

        tracing::info!(label, "reference removed");
        Ok(self.reload())
    }
}
