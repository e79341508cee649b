//! Viola–Jones Haar cascade face locator.
//!
//! The cascade is a fixed, pre-trained sequence of boosted stages, each a sum
//! of decision stumps over weighted rectangle features. Windows are scanned
//! across a scale pyramid with variance normalization on integral images, and
//! raw hits are merged by rectangle grouping.
//!
//! Cascades load from OpenCV's XML format (as shipped in
//! `haarcascade_frontalface_default.xml`, stump classifiers over upright
//! features only) or from an equivalent JSON layout:
//!
//! ```json
//! {
//!   "window_width": 24, "window_height": 24,
//!   "stages": [
//!     { "threshold": -1.29,
//!       "stumps": [
//!         { "rects": [ { "x": 6, "y": 4, "width": 12, "height": 9, "weight": -1.0 },
//!                      { "x": 6, "y": 7, "width": 12, "height": 3, "weight": 3.0 } ],
//!           "threshold": -0.0315, "left": 2.087, "right": -2.217 } ] } ]
//! }
//! ```

use crate::types::Rect;
use image::GrayImage;
use roxmltree::Node;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Relative tolerance when deciding whether two hits describe the same face.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("cascade I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cascade XML error: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Detector sensitivity knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensitivity {
    /// Window growth between pyramid levels. Must be > 1; smaller is more
    /// thorough and slower.
    pub scale_factor: f32,
    /// Minimum number of overlapping raw hits a face needs to survive
    /// grouping. 0 returns raw hits.
    pub min_neighbors: u32,
    /// Detections smaller than this (either side, pixels) are ignored.
    pub min_face_size: u32,
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 4,
            min_face_size: 80,
        }
    }
}

/// Anything that can find face rectangles in a grayscale frame.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, frame: &GrayImage, sensitivity: &Sensitivity) -> Vec<Rect>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Single-feature weak classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub stumps: Vec<Stump>,
}

/// A trained Haar cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

impl HaarCascade {
    /// Load a cascade from disk: OpenCV XML for `.xml` files, JSON otherwise.
    pub fn load(path: &Path) -> Result<Self, LocatorError> {
        if !path.exists() {
            return Err(LocatorError::CascadeNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let cascade = if is_xml {
            Self::from_opencv_xml(&text)?
        } else {
            Self::from_json(&text)?
        };
        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    pub fn from_json(text: &str) -> Result<Self, LocatorError> {
        let cascade: Self = serde_json::from_str(text)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse an OpenCV `opencv-cascade-classifier` document.
    pub fn from_opencv_xml(text: &str) -> Result<Self, LocatorError> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| invalid("no <cascade> element; old-style cascades are not supported"))?;

        if let Some(kind) = root.children().find(|n| n.has_tag_name("featureType")) {
            let kind = kind.text().unwrap_or("").trim();
            if kind != "HAAR" {
                return Err(invalid(format!("unsupported feature type {kind:?}")));
            }
        }

        let features = items(child(root, "features")?)
            .enumerate()
            .map(|(i, feature)| parse_feature(i, feature))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .enumerate()
            .map(|(si, stage)| -> Result<Stage, LocatorError> {
                let stumps = items(child(stage, "weakClassifiers")?)
                    .map(|weak| -> Result<Stump, LocatorError> {
                        let nodes: Vec<f32> = numbers(child(weak, "internalNodes")?)?;
                        let leaves: Vec<f32> = numbers(child(weak, "leafValues")?)?;
                        if nodes.len() != 4 || leaves.len() != 2 {
                            return Err(invalid(format!(
                                "stage {si}: only single-split classifiers are supported"
                            )));
                        }
                        let index = nodes[2] as usize;
                        let rects = features.get(index).cloned().ok_or_else(|| {
                            invalid(format!("stage {si}: feature {index} out of range"))
                        })?;
                        Ok(Stump {
                            rects,
                            threshold: nodes[3],
                            left: leaves[0],
                            right: leaves[1],
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage {
                    threshold: scalar(child(stage, "stageThreshold")?)?,
                    stumps,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = Self {
            window_width: scalar(child(root, "width")?)?,
            window_height: scalar(child(root, "height")?)?,
            stages,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), LocatorError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(LocatorError::Invalid("window size must be non-zero".into()));
        }
        if self.stages.is_empty() {
            return Err(LocatorError::Invalid("cascade has no stages".into()));
        }
        for (si, stage) in self.stages.iter().enumerate() {
            if stage.stumps.is_empty() {
                return Err(LocatorError::Invalid(format!("stage {si} has no stumps")));
            }
            for stump in &stage.stumps {
                if stump.rects.is_empty() {
                    return Err(LocatorError::Invalid(format!("stage {si} has a featureless stump")));
                }
                for r in &stump.rects {
                    if r.width == 0
                        || r.height == 0
                        || r.x + r.width > self.window_width
                        || r.y + r.height > self.window_height
                    {
                        return Err(LocatorError::Invalid(format!(
                            "stage {si}: rect {r:?} outside {}x{} window",
                            self.window_width, self.window_height
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Raw (ungrouped) hits across the scale pyramid.
    fn scan(&self, frame: &GrayImage, sensitivity: &Sensitivity) -> Vec<Rect> {
        let (img_w, img_h) = frame.dimensions();
        let integral = IntegralImages::new(frame);
        let scale_factor = sensitivity.scale_factor.max(1.01);

        let mut hits = Vec::new();
        let mut scale = 1.0f32;
        loop {
            let (win_w, win_h) = self.window_at(scale);
            if win_w > img_w || win_h > img_h {
                break;
            }
            if win_w >= sensitivity.min_face_size && win_h >= sensitivity.min_face_size {
                let scaled = self.scaled_stages(scale, win_w, win_h);
                let step = (if scale > 2.0 { scale } else { 2.0 * scale }).round().max(1.0) as usize;

                for y in (0..=img_h - win_h).step_by(step) {
                    for x in (0..=img_w - win_w).step_by(step) {
                        if evaluate_window(&scaled, &integral, x, y, win_w, win_h) {
                            hits.push(Rect::new(x, y, win_w, win_h));
                        }
                    }
                }
            }
            scale *= scale_factor;
        }
        hits
    }

    fn window_at(&self, scale: f32) -> (u32, u32) {
        (
            (self.window_width as f32 * scale).round() as u32,
            (self.window_height as f32 * scale).round() as u32,
        )
    }

    /// Scale every feature rectangle and rebalance the first weight so each
    /// feature still sums to zero over a constant window despite rounding.
    ///
    /// Edges are scaled rather than sizes, and clamped to the scaled window,
    /// so no rectangle reaches past the window it is evaluated in.
    fn scaled_stages(&self, scale: f32, win_w: u32, win_h: u32) -> Vec<ScaledStage> {
        let span = |start: u32, len: u32, limit: u32| {
            let end = (((start + len) as f32 * scale).round() as u32).min(limit).max(1);
            let begin = ((start as f32 * scale).round() as u32).min(end - 1);
            (begin, end - begin)
        };
        self.stages
            .iter()
            .map(|stage| ScaledStage {
                threshold: stage.threshold,
                stumps: stage
                    .stumps
                    .iter()
                    .map(|stump| {
                        let mut rects: Vec<ScaledRect> = stump
                            .rects
                            .iter()
                            .map(|r| {
                                let (x, width) = span(r.x, r.width, win_w);
                                let (y, height) = span(r.y, r.height, win_h);
                                ScaledRect {
                                    x,
                                    y,
                                    width,
                                    height,
                                    weight: r.weight as f64,
                                }
                            })
                            .collect();

                        if rects.len() > 1 {
                            let area0 = rects[0].area();
                            let rest: f64 = rects[1..].iter().map(|r| r.weight * r.area()).sum();
                            rects[0].weight = -rest / area0;
                        }

                        ScaledStump {
                            rects,
                            threshold: stump.threshold as f64,
                            left: stump.left as f64,
                            right: stump.right as f64,
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

impl FaceLocator for HaarCascade {
    fn locate(&self, frame: &GrayImage, sensitivity: &Sensitivity) -> Vec<Rect> {
        let hits = self.scan(frame, sensitivity);
        let faces = group_rectangles(&hits, sensitivity.min_neighbors);
        tracing::trace!(raw = hits.len(), faces = faces.len(), "cascade scan");
        faces
    }
}

struct ScaledRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

impl ScaledRect {
    fn area(&self) -> f64 {
        (self.width * self.height) as f64
    }
}

struct ScaledStump {
    rects: Vec<ScaledRect>,
    threshold: f64,
    left: f64,
    right: f64,
}

struct ScaledStage {
    threshold: f32,
    stumps: Vec<ScaledStump>,
}

/// Summed-area tables for pixel values and squared pixel values.
struct IntegralImages {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImages {
    fn new(src: &GrayImage) -> Self {
        let (w, h) = (src.width() as usize, src.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = src.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0] - table[y1 * stride + x0] - table[y0 * stride + x1]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}

fn evaluate_window(
    stages: &[ScaledStage],
    integral: &IntegralImages,
    x: u32,
    y: u32,
    win_w: u32,
    win_h: u32,
) -> bool {
    let inv_area = 1.0 / (win_w as f64 * win_h as f64);
    let mean = integral.sum(x, y, win_w, win_h) as f64 * inv_area;
    let variance = integral.sq_sum(x, y, win_w, win_h) as f64 * inv_area - mean * mean;
    let std_dev = if variance > 0.0 { variance.sqrt() } else { 1.0 };

    for stage in stages {
        let mut stage_sum = 0.0f64;
        for stump in &stage.stumps {
            let value: f64 = stump
                .rects
                .iter()
                .map(|r| {
                    integral.sum(x + r.x, y + r.y, r.width, r.height) as f64 * r.weight
                })
                .sum::<f64>()
                * inv_area;
            stage_sum += if value < stump.threshold * std_dev {
                stump.left
            } else {
                stump.right
            };
        }
        if stage_sum < stage.threshold as f64 {
            return false;
        }
    }
    true
}

fn invalid(msg: impl Into<String>) -> LocatorError {
    LocatorError::Invalid(msg.into())
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Result<Node<'a, 'i>, LocatorError> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .ok_or_else(|| invalid(format!("missing <{tag}> in <{}>", node.tag_name().name())))
}

/// OpenCV stores sequences as runs of `<_>` elements.
fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn numbers<T: FromStr>(node: Node<'_, '_>) -> Result<Vec<T>, LocatorError> {
    node.text()
        .unwrap_or("")
        .split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| {
                invalid(format!("bad number {token:?} in <{}>", node.tag_name().name()))
            })
        })
        .collect()
}

fn scalar<T: FromStr>(node: Node<'_, '_>) -> Result<T, LocatorError> {
    let mut values = numbers(node)?;
    match (values.pop(), values.is_empty()) {
        (Some(value), true) => Ok(value),
        _ => Err(invalid(format!("<{}> must hold one number", node.tag_name().name()))),
    }
}

/// `x y width height weight` per rectangle. Tilted features are refused.
fn parse_feature(index: usize, feature: Node<'_, '_>) -> Result<Vec<WeightedRect>, LocatorError> {
    let tilted = feature
        .children()
        .find(|n| n.has_tag_name("tilted"))
        .and_then(|n| n.text())
        .is_some_and(|t| t.trim() != "0");
    if tilted {
        return Err(invalid(format!("feature {index} is tilted")));
    }

    items(child(feature, "rects")?)
        .map(|rect| -> Result<WeightedRect, LocatorError> {
            let values: Vec<f32> = numbers(rect)?;
            let &[x, y, width, height, weight] = values.as_slice() else {
                return Err(invalid(format!("feature {index}: rect needs five values")));
            };
            if [x, y, width, height].iter().any(|v| *v < 0.0 || v.fract() != 0.0) {
                return Err(invalid(format!("feature {index}: non-integral rect")));
            }
            Ok(WeightedRect {
                x: x as u32,
                y: y as u32,
                width: width as u32,
                height: height as u32,
                weight,
            })
        })
        .collect()
}

fn similar(a: &Rect, b: &Rect) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge overlapping raw hits into faces.
///
/// Hits are partitioned into classes of similar rectangles; each class is
/// averaged and kept only if it has more than `min_neighbors` members.
/// Small faces enclosed by a well-supported larger face are dropped.
pub fn group_rectangles(hits: &[Rect], min_neighbors: u32) -> Vec<Rect> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits.to_vec();
    }

    let n = hits.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&hits[i], &hits[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Accumulate per class: [x, y, w, h] sums and member count.
    let mut classes: Vec<(usize, [u64; 4], u32)> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match classes.iter().position(|c| c.0 == root) {
            Some(pos) => pos,
            None => {
                classes.push((root, [0; 4], 0));
                classes.len() - 1
            }
        };
        let entry = &mut classes[slot];
        entry.1[0] += hit.x as u64;
        entry.1[1] += hit.y as u64;
        entry.1[2] += hit.width as u64;
        entry.1[3] += hit.height as u64;
        entry.2 += 1;
    }

    let averaged: Vec<(Rect, u32)> = classes
        .iter()
        .map(|(_, s, count)| {
            let c = *count as f64;
            let avg = |v: u64| (v as f64 / c).round() as u32;
            (Rect::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3])), *count)
        })
        .collect();

    averaged
        .iter()
        .enumerate()
        .filter(|(_, (_, n1))| *n1 > min_neighbors)
        .filter(|(i, (r1, n1))| {
            !averaged.iter().enumerate().any(|(j, (r2, n2))| {
                if j == *i || *n2 <= min_neighbors {
                    return false;
                }
                let dx = (r2.width as f64 * GROUP_EPS).round() as i64;
                let dy = (r2.height as f64 * GROUP_EPS).round() as i64;
                let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
                let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
                let inside = x1 >= x2 - dx
                    && y1 >= y2 - dy
                    && x1 + w1 <= x2 + w2 + dx
                    && y1 + h1 <= y2 + h2 + dy;
                inside && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}
