//! facegate-core — Face location and identification primitives.
//!
//! A Haar cascade finds faces in grayscale frames, the normalizer turns a
//! face region into a fixed-size template, and an LBPH classifier maps
//! templates to identity labels with a distance score.

pub mod classifier;
pub mod locator;
pub mod normalizer;
pub mod persist;
pub mod types;

pub use classifier::{ClassifierError, LbphModel, LbphParams};
pub use locator::{FaceLocator, HaarCascade, LocatorError, Sensitivity};
pub use normalizer::{crop_face, normalize, NormalizeError};
pub use types::{Label, Prediction, Rect, Template, TEMPLATE_SIZE};
