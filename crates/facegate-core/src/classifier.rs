//! Local binary pattern histogram (LBPH) nearest-template classifier.
//!
//! Each template is encoded as a grid of rotation-invariant LBP histograms.
//! Prediction returns the label of the closest training histogram under the
//! alternative chi-square distance; the distance doubles as the confidence
//! score (0 = identical, larger = less similar). No accept/reject decision is
//! made here — callers threshold the score themselves.

use crate::persist;
use crate::types::{Label, Prediction, Template, TEMPLATE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Number of distinct rotation-invariant 8-neighbour patterns.
const RI_BINS: usize = 36;
const DEFAULT_GRID: u32 = 8;

/// Neighbour offsets in circular order starting top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("cannot train on an empty sample set")]
    EmptyTrainingSet,
    #[error("sample/label count mismatch: {samples} samples, {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("classifier has no trained histograms")]
    Untrained,
    #[error("corrupt classifier artifact: {0}")]
    Corrupt(String),
    #[error("classifier I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("classifier encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Spatial grid used to partition each template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    fn feature_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * RI_BINS
    }
}

/// Trained LBPH model: one spatial histogram per training sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<Label>,
    /// Fingerprint of the data this model was trained from, set by the owner.
    source_digest: Option<String>,
}

impl LbphModel {
    /// Train with the default 8×8 grid.
    pub fn train(samples: &[Template], labels: &[Label]) -> Result<Self, ClassifierError> {
        Self::train_with(LbphParams::default(), samples, labels)
    }

    pub fn train_with(
        params: LbphParams,
        samples: &[Template],
        labels: &[Label],
    ) -> Result<Self, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if samples.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                samples: samples.len(),
                labels: labels.len(),
            });
        }

        let histograms = samples
            .iter()
            .map(|s| spatial_histogram(s, &params))
            .collect();

        tracing::debug!(
            samples = samples.len(),
            grid_x = params.grid_x,
            grid_y = params.grid_y,
            "trained LBPH model"
        );

        Ok(Self {
            params,
            histograms,
            labels: labels.to_vec(),
            source_digest: None,
        })
    }

    /// Return the nearest training label and its distance.
    pub fn predict(&self, sample: &Template) -> Result<Prediction, ClassifierError> {
        if self.histograms.is_empty() {
            return Err(ClassifierError::Untrained);
        }

        let probe = spatial_histogram(sample, &self.params);
        let mut best: Option<Prediction> = None;

        for (hist, &label) in self.histograms.iter().zip(self.labels.iter()) {
            let score = chi_square_alt(&probe, hist);
            if best.map_or(true, |b| score < b.score) {
                best = Some(Prediction { label, score });
            }
        }

        best.ok_or(ClassifierError::Untrained)
    }

    /// Distinct labels the model can predict.
    pub fn known_labels(&self) -> BTreeSet<Label> {
        self.labels.iter().copied().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    pub fn source_digest(&self) -> Option<&str> {
        self.source_digest.as_deref()
    }

    pub fn set_source_digest(&mut self, digest: impl Into<String>) {
        self.source_digest = Some(digest.into());
    }

    /// Persist the model atomically.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        let bytes = bincode::serialize(self)?;
        persist::write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Load and validate a persisted model.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let bytes = std::fs::read(path)?;
        let model: Self = bincode::deserialize(&bytes)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.histograms.len() != self.labels.len() {
            return Err(ClassifierError::Corrupt(format!(
                "{} histograms for {} labels",
                self.histograms.len(),
                self.labels.len()
            )));
        }
        let expected = self.params.feature_len();
        if let Some(bad) = self.histograms.iter().find(|h| h.len() != expected) {
            return Err(ClassifierError::Corrupt(format!(
                "histogram length {} (expected {expected})",
                bad.len()
            )));
        }
        Ok(())
    }
}

/// Map every 8-bit LBP code to its rotation-invariant bin (0..36).
fn rotation_invariant_bins() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let min_rotation = |code: u8| (0..8).map(|r| code.rotate_right(r)).min().unwrap_or(code);

        let mut canonical: Vec<u8> = (0..=255u8).map(min_rotation).collect();
        canonical.sort_unstable();
        canonical.dedup();

        let mut table = [0u8; 256];
        for code in 0..=255u8 {
            let bin = canonical
                .binary_search(&min_rotation(code))
                .unwrap_or_default();
            table[code as usize] = bin as u8;
        }
        table
    })
}

/// Rotation-invariant LBP bin for every interior pixel, row-major.
fn lbp_bins(sample: &Template) -> Vec<u8> {
    let table = rotation_invariant_bins();
    let inner = TEMPLATE_SIZE - 2;
    let mut out = Vec::with_capacity((inner * inner) as usize);

    for y in 1..TEMPLATE_SIZE - 1 {
        for x in 1..TEMPLATE_SIZE - 1 {
            let center = sample.at(x, y);
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                if sample.at(nx, ny) >= center {
                    code |= 1 << bit;
                }
            }
            out.push(table[code as usize]);
        }
    }
    out
}

/// Concatenated per-cell histograms, each normalized by the cell area.
fn spatial_histogram(sample: &Template, params: &LbphParams) -> Vec<f32> {
    let bins = lbp_bins(sample);
    let side = (TEMPLATE_SIZE - 2) as usize;
    let grid_x = params.grid_x.max(1) as usize;
    let grid_y = params.grid_y.max(1) as usize;
    let cell_w = side / grid_x;
    let cell_h = side / grid_y;
    let area = (cell_w * cell_h).max(1) as f32;

    let mut features = vec![0f32; params.feature_len()];
    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let hist = &mut features[(gy * grid_x + gx) * RI_BINS..][..RI_BINS];
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    hist[bins[y * side + x] as usize] += 1.0;
                }
            }
            for v in hist.iter_mut() {
                *v /= area;
            }
        }
    }
    features
}

/// Alternative chi-square distance: 2·Σ (a−b)² / (a+b).
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > f64::EPSILON {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::tests::scratch_dir;

    fn template_from(f: impl Fn(u32, u32) -> u8) -> Template {
        let mut pixels = Vec::with_capacity((TEMPLATE_SIZE * TEMPLATE_SIZE) as usize);
        for y in 0..TEMPLATE_SIZE {
            for x in 0..TEMPLATE_SIZE {
                pixels.push(f(x, y));
            }
        }
        Template::from_pixels(pixels).unwrap()
    }

    fn stripes() -> Template {
        template_from(|x, _| if (x / 3) % 2 == 0 { 40 } else { 210 })
    }

    fn checker() -> Template {
        template_from(|x, y| if ((x / 5) + (y / 5)) % 2 == 0 { 30 } else { 220 })
    }

    fn noise(seed: u32) -> Template {
        template_from(|x, y| {
            let mut v = seed ^ (x.wrapping_mul(73_856_093)) ^ (y.wrapping_mul(19_349_663));
            v ^= v << 13;
            v ^= v >> 17;
            v ^= v << 5;
            (v & 0xFF) as u8
        })
    }

    #[test]
    fn test_rotation_invariant_table_has_36_bins() {
        let table = rotation_invariant_bins();
        let distinct: BTreeSet<u8> = table.iter().copied().collect();
        assert_eq!(distinct.len(), RI_BINS);
        // A pattern and its rotation share a bin.
        assert_eq!(table[0b0000_0011], table[0b0000_0110]);
        assert_eq!(table[0b1000_0001], table[0b0000_0011]);
    }

    #[test]
    fn test_cell_histograms_sum_to_one() {
        let features = spatial_histogram(&checker(), &LbphParams::default());
        for cell in features.chunks(RI_BINS) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "cell sums to {total}");
        }
    }

    #[test]
    fn test_train_rejects_empty() {
        let err = LbphModel::train(&[], &[]).unwrap_err();
        assert!(matches!(err, ClassifierError::EmptyTrainingSet));
    }

    #[test]
    fn test_train_rejects_mismatched_lengths() {
        let err = LbphModel::train(&[stripes(), checker()], &[Label(0)]).unwrap_err();
        assert!(matches!(err, ClassifierError::LengthMismatch { samples: 2, labels: 1 }));
    }

    #[test]
    fn test_identical_sample_scores_zero() {
        let model = LbphModel::train(&[stripes(), checker()], &[Label(0), Label(1)]).unwrap();
        let p = model.predict(&checker()).unwrap();
        assert_eq!(p.label, Label(1));
        assert_eq!(p.score, 0.0);
    }

    #[test]
    fn test_predicts_nearest_texture() {
        let model = LbphModel::train(
            &[stripes(), checker(), noise(1)],
            &[Label(0), Label(1), Label(2)],
        )
        .unwrap();

        // A different noise realisation is texturally closest to the noise sample.
        let p = model.predict(&noise(99)).unwrap();
        assert_eq!(p.label, Label(2));
        assert!(p.score > 0.0);
    }

    #[test]
    fn test_empty_model_predict_fails() {
        let mut model = LbphModel::train(&[stripes()], &[Label(0)]).unwrap();
        model.histograms.clear();
        model.labels.clear();
        assert!(matches!(model.predict(&stripes()), Err(ClassifierError::Untrained)));
    }

    #[test]
    fn test_save_load_preserves_predictions_and_digest() {
        let path = scratch_dir().join("model.bin");

        let mut model = LbphModel::train(&[stripes(), checker()], &[Label(3), Label(7)]).unwrap();
        model.set_source_digest("abc123");
        model.save(&path).unwrap();

        let loaded = LbphModel::load(&path).unwrap();
        assert_eq!(loaded.source_digest(), Some("abc123"));
        assert_eq!(loaded.known_labels(), BTreeSet::from([Label(3), Label(7)]));
        assert_eq!(loaded.predict(&stripes()).unwrap().label, Label(3));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let path = scratch_dir().join("garbage.bin");
        std::fs::write(&path, b"not a model").unwrap();
        assert!(LbphModel::load(&path).is_err());
    }
}
