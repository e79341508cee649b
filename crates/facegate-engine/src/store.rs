//! Identity model store: the persisted registry of identities, their
//! training samples, and the classifier trained from them.
//!
//! Two files live in the data directory. `faces_data.bin` is the source of
//! truth (samples, labels, identities, next label). `face_model.bin` is a
//! cache of the trained classifier, stamped with the SHA-256 digest of the
//! data file it was trained from; a digest mismatch marks it stale.
//!
//! Mutations train in memory first, then write the data file and the
//! artifact. If the artifact write fails the data file is restored, so the
//! pair on disk always describes the same state.

use facegate_core::persist::write_atomic;
use facegate_core::{ClassifierError, Label, LbphModel, Prediction, Template};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const DATA_FILE: &str = "faces_data.bin";
pub const MODEL_FILE: &str = "face_model.bin";
const STORE_VERSION: u32 = 1;

/// Store shared between the engine facade and its worker.
pub type SharedStore = Arc<Mutex<ModelStore>>;

/// Lock the shared store, recovering the guard if a holder panicked.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, ModelStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store data is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("training failed: {0}")]
    Training(#[from] ClassifierError),
    #[error("failed to write classifier artifact: {0}")]
    Artifact(#[source] ClassifierError),
    #[error("no identity with label {0}")]
    UnknownLabel(Label),
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("username already registered: {0}")]
    DuplicateUsername(String),
}

/// Locations of the two store artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub data: PathBuf,
    pub model: PathBuf,
}

impl StorePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            data: dir.join(DATA_FILE),
            model: dir.join(MODEL_FILE),
        }
    }
}

/// Persisted registry contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    pub version: u32,
    pub samples: Vec<Template>,
    /// Parallel to `samples`.
    pub labels: Vec<Label>,
    pub identities: BTreeMap<Label, String>,
    /// Next label to issue. Only ever grows.
    pub next_label: u32,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            samples: Vec::new(),
            labels: Vec::new(),
            identities: BTreeMap::new(),
            next_label: 0,
        }
    }
}

impl StoreData {
    fn validate(&self) -> Result<(), StoreError> {
        if self.version != STORE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version {}",
                self.version
            )));
        }
        if self.samples.len() != self.labels.len() {
            return Err(StoreError::Corrupt(format!(
                "{} samples but {} labels",
                self.samples.len(),
                self.labels.len()
            )));
        }

        let sampled: BTreeSet<Label> = self.labels.iter().copied().collect();
        let registered: BTreeSet<Label> = self.identities.keys().copied().collect();
        if let Some(orphan) = sampled.difference(&registered).next() {
            return Err(StoreError::Corrupt(format!("samples for unregistered label {orphan}")));
        }
        if let Some(empty) = registered.difference(&sampled).next() {
            return Err(StoreError::Corrupt(format!("identity {empty} has no samples")));
        }
        if let Some(max) = registered.last() {
            if max.0 >= self.next_label {
                return Err(StoreError::Corrupt(format!(
                    "label {max} not below next label {}",
                    self.next_label
                )));
            }
        }

        let mut names = BTreeSet::new();
        for name in self.identities.values() {
            if name.is_empty() || !names.insert(name.as_str()) {
                return Err(StoreError::Corrupt(format!("invalid or duplicate username {name:?}")));
            }
        }
        Ok(())
    }

    fn samples_for(&self, label: Label) -> usize {
        self.labels.iter().filter(|&&l| l == label).count()
    }
}

/// Freshness of the on-disk classifier artifact relative to the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    /// Present and trained from the current data.
    Fresh,
    /// Present but unreadable or trained from different data.
    Stale,
    /// Absent.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub label: Label,
    pub username: String,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub identities: Vec<IdentitySummary>,
    pub total_samples: usize,
    pub data_file_present: bool,
    pub model_file_present: bool,
    pub model_state: ModelState,
    /// Why the data file was rejected, when the store opened fail-closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption: Option<String>,
}

/// In-memory view of the persisted store plus the loaded classifier.
#[derive(Debug)]
pub struct ModelStore {
    paths: StorePaths,
    data: StoreData,
    model: Option<LbphModel>,
    model_state: ModelState,
    corruption: Option<String>,
}

impl ModelStore {
    /// Load both artifacts.
    ///
    /// A missing data file yields an empty store. An unreadable or
    /// inconsistent data file is an error. A missing, unreadable or stale
    /// classifier artifact is tolerated: the store loads without a model and
    /// [`ModelStore::rebuild`] can regenerate it.
    pub fn open(paths: StorePaths) -> Result<Self, StoreError> {
        let (data, digest) = match read_data(&paths.data)? {
            Some((data, digest)) => (data, Some(digest)),
            None => (StoreData::default(), None),
        };

        let (model, model_state) = match (paths.model.exists(), digest) {
            (false, _) => (None, ModelState::Missing),
            (true, None) => (None, ModelState::Stale),
            (true, Some(digest)) => match LbphModel::load(&paths.model) {
                Ok(model) if model.source_digest() == Some(digest.as_str()) => {
                    (Some(model), ModelState::Fresh)
                }
                Ok(_) => {
                    tracing::warn!(path = %paths.model.display(), "classifier artifact is stale");
                    (None, ModelState::Stale)
                }
                Err(e) => {
                    tracing::warn!(path = %paths.model.display(), error = %e, "classifier artifact unreadable");
                    (None, ModelState::Stale)
                }
            },
        };

        tracing::info!(
            identities = data.identities.len(),
            samples = data.samples.len(),
            model = ?model_state,
            "model store opened"
        );

        Ok(Self {
            paths,
            data,
            model,
            model_state,
            corruption: None,
        })
    }

    /// Like [`ModelStore::open`], but a corrupt data file yields an empty,
    /// model-less store instead of an error.
    ///
    /// Such a store reports no identities and refuses every mutation until
    /// [`ModelStore::rebuild`] succeeds against a readable data file, so the
    /// damaged file is never overwritten.
    pub fn open_fail_closed(paths: StorePaths) -> Result<Self, StoreError> {
        match Self::open(paths.clone()) {
            Err(StoreError::Corrupt(reason)) => {
                tracing::warn!(
                    path = %paths.data.display(),
                    %reason,
                    "sample data is corrupt; no identities available until it is restored"
                );
                Ok(Self {
                    paths,
                    data: StoreData::default(),
                    model: None,
                    model_state: ModelState::Missing,
                    corruption: Some(reason),
                })
            }
            other => other,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn data(&self) -> &StoreData {
        &self.data
    }

    pub fn identities(&self) -> &BTreeMap<Label, String> {
        &self.data.identities
    }

    pub fn has_identities(&self) -> bool {
        !self.data.identities.is_empty()
    }

    pub fn contains_username(&self, username: &str) -> bool {
        self.data.identities.values().any(|u| u == username)
    }

    pub fn username_for(&self, label: Label) -> Option<&str> {
        self.data.identities.get(&label).map(String::as_str)
    }

    pub fn sample_count(&self) -> usize {
        self.data.samples.len()
    }

    /// The loaded classifier, if a fresh one is available.
    pub fn classifier(&self) -> Option<&LbphModel> {
        self.model.as_ref()
    }

    pub fn model_state(&self) -> ModelState {
        self.model_state
    }

    /// Reason the data file was rejected, for stores opened fail-closed.
    pub fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }

    /// Whether identities exist but no usable classifier was loaded.
    pub fn needs_rebuild(&self) -> bool {
        self.has_identities() && self.model.is_none()
    }

    /// Predict against the loaded classifier. `None` when no model is loaded.
    pub fn predict(&self, sample: &Template) -> Option<Result<Prediction, ClassifierError>> {
        self.model.as_ref().map(|m| m.predict(sample))
    }

    /// Register `username` with a freshly captured batch of samples.
    ///
    /// The classifier is retrained on every stored sample, not only the
    /// new batch. Nothing is persisted if training fails.
    pub fn enroll(&mut self, username: &str, samples: Vec<Template>) -> Result<Label, StoreError> {
        if username.is_empty() {
            return Err(StoreError::EmptyUsername);
        }
        if self.contains_username(username) {
            return Err(StoreError::DuplicateUsername(username.to_string()));
        }
        if samples.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet.into());
        }

        let label = Label(self.data.next_label);
        let count = samples.len();
        let mut data = self.data.clone();
        data.next_label += 1;
        data.identities.insert(label, username.to_string());
        data.labels.extend(std::iter::repeat(label).take(count));
        data.samples.extend(samples);

        self.commit(data)?;
        tracing::info!(%label, username, samples = count, "identity enrolled");
        Ok(label)
    }

    /// Remove an identity and all of its samples, returning its username.
    ///
    /// Retrains on the remaining samples, or deletes the artifact when none
    /// remain. On failure the store keeps its prior state.
    pub fn delete(&mut self, label: Label) -> Result<String, StoreError> {
        let Some(username) = self.data.identities.get(&label).cloned() else {
            return Err(StoreError::UnknownLabel(label));
        };

        let mut data = self.data.clone();
        data.identities.remove(&label);
        let (samples, labels): (Vec<_>, Vec<_>) = data
            .samples
            .into_iter()
            .zip(data.labels)
            .filter(|(_, l)| *l != label)
            .unzip();
        data.samples = samples;
        data.labels = labels;

        self.commit(data)?;
        tracing::info!(%label, username = %username, remaining = self.sample_count(), "identity deleted");
        Ok(username)
    }

    /// Retrain the classifier from the persisted data file without changing it.
    ///
    /// Returns the number of samples trained on.
    pub fn rebuild(&mut self) -> Result<usize, StoreError> {
        let Some((data, digest)) = read_data(&self.paths.data)? else {
            remove_if_exists(&self.paths.model)?;
            self.data = StoreData::default();
            self.model = None;
            self.model_state = ModelState::Missing;
            self.corruption = None;
            tracing::info!("rebuild: no sample data, classifier removed");
            return Ok(0);
        };

        if data.samples.is_empty() {
            remove_if_exists(&self.paths.model)?;
            self.model = None;
            self.model_state = ModelState::Missing;
        } else {
            let mut model = LbphModel::train(&data.samples, &data.labels)?;
            model.set_source_digest(digest);
            model.save(&self.paths.model).map_err(StoreError::Artifact)?;
            self.model = Some(model);
            self.model_state = ModelState::Fresh;
        }

        let count = data.samples.len();
        self.data = data;
        self.corruption = None;
        tracing::info!(samples = count, "classifier rebuilt");
        Ok(count)
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            identities: self
                .data
                .identities
                .iter()
                .map(|(&label, username)| IdentitySummary {
                    label,
                    username: username.clone(),
                    samples: self.data.samples_for(label),
                })
                .collect(),
            total_samples: self.data.samples.len(),
            data_file_present: self.paths.data.exists(),
            model_file_present: self.paths.model.exists(),
            model_state: self.model_state,
            corruption: self.corruption.clone(),
        }
    }

    /// Train, then persist data followed by the artifact; adopt `data` only
    /// once both are on disk.
    fn commit(&mut self, data: StoreData) -> Result<(), StoreError> {
        if let Some(reason) = &self.corruption {
            return Err(StoreError::Corrupt(reason.clone()));
        }
        data.validate()?;
        let bytes = bincode::serialize(&data)?;
        let digest = digest_hex(&bytes);

        let model = if data.samples.is_empty() {
            None
        } else {
            let mut model = LbphModel::train(&data.samples, &data.labels)?;
            model.set_source_digest(digest);
            Some(model)
        };

        let previous = match std::fs::read(&self.paths.data) {
            Ok(prev) => Some(prev),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.paths.data.clone(),
                    source,
                })
            }
        };

        if let Some(dir) = self.paths.data.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Persist {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        write_atomic(&self.paths.data, &bytes).map_err(|source| StoreError::Persist {
            path: self.paths.data.clone(),
            source,
        })?;

        let artifact = match &model {
            Some(m) => m.save(&self.paths.model).map_err(StoreError::Artifact),
            None => remove_if_exists(&self.paths.model),
        };
        if let Err(e) = artifact {
            self.restore_data(previous);
            return Err(e);
        }

        self.model_state = if model.is_some() {
            ModelState::Fresh
        } else {
            ModelState::Missing
        };
        self.model = model;
        self.data = data;
        Ok(())
    }

    fn restore_data(&self, previous: Option<Vec<u8>>) {
        let restored = match previous {
            Some(bytes) => write_atomic(&self.paths.data, &bytes),
            None => std::fs::remove_file(&self.paths.data),
        };
        match restored {
            Ok(()) => tracing::warn!("artifact write failed; sample data rolled back"),
            Err(e) => tracing::error!(
                error = %e,
                path = %self.paths.data.display(),
                "failed to roll back sample data; run rebuild"
            ),
        }
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Read and validate the data file. `None` if it does not exist.
fn read_data(path: &Path) -> Result<Option<(StoreData, String)>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let data: StoreData =
        bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    data.validate()?;
    Ok(Some((data, digest_hex(&bytes))))
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Persist {
            path: path.to_path_buf(),
            source,
        }),
    }
}
