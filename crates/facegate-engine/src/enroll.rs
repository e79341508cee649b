//! Enrollment pipeline: capture a batch of single-face samples for one new
//! username, then commit it to the store.

use crate::engine::Outcome;
use crate::pipeline::{scan_frame, FaceScan, FrameStatus, PipelineContext, Poll};
use crate::store::{self, SharedStore};
use facegate_hw::FrameSource;

/// Capture until `batch_size` samples are collected, then enroll and retrain.
///
/// The caller has already checked that `username` is valid and unregistered.
/// Samples from a cancelled or failed run are discarded.
pub fn run_enroll(
    source: &mut dyn FrameSource,
    ctx: &PipelineContext<'_>,
    store: &SharedStore,
    username: &str,
    batch_size: usize,
) -> Outcome {
    let mut samples = Vec::with_capacity(batch_size);
    tracing::info!(username, batch_size, "enrollment capturing");

    while samples.len() < batch_size {
        let frame = match ctx.poll(source) {
            Poll::Frame(frame) => frame,
            Poll::Stop(outcome) => {
                tracing::info!(captured = samples.len(), "enrollment stopped; samples discarded");
                return outcome;
            }
        };

        let gray = frame.to_grayscale();
        let (faces, scan) = scan_frame(&gray, ctx.locator, &ctx.sensitivity);
        match scan {
            FaceScan::Single { template, .. } => samples.push(template),
            FaceScan::Multiple(n) => tracing::debug!(faces = n, "multiple faces; frame skipped"),
            FaceScan::None => {}
        }

        ctx.emit(
            frame,
            faces,
            FrameStatus::Enrolling {
                captured: samples.len(),
                target: batch_size,
            },
        );
        if samples.len() < batch_size {
            ctx.pause();
        }
    }

    let captured = samples.len();
    match store::lock(store).enroll(username, samples) {
        Ok(label) => Outcome::Enrolled {
            username: username.to_string(),
            label,
            samples: captured,
        },
        Err(e) => {
            tracing::error!(username, error = %e, "enrollment failed");
            Outcome::Failed(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::store::{ModelStore, StorePaths};
    use crate::testing::{FakeLocator, FrameSpec, ScriptedDevice};
    use facegate_core::{Label, Sensitivity};
    use facegate_hw::VideoDevice;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn run(device: &ScriptedDevice, store: &SharedStore, username: &str, batch: usize) -> Outcome {
        let cancel = AtomicBool::new(false);
        let (tx, _rx) = mpsc::channel(4);
        let ctx = PipelineContext {
            locator: &FakeLocator,
            sensitivity: Sensitivity::default(),
            frame_interval: Duration::ZERO,
            cancel: &cancel,
            events: &tx,
        };
        let mut source = device.open().unwrap();
        run_enroll(source.as_mut(), &ctx, store, username, batch)
    }

    fn empty_store() -> SharedStore {
        let dir = crate::store::tests::scratch_dir();
        Arc::new(Mutex::new(ModelStore::open(StorePaths::in_dir(&dir)).unwrap()))
    }

    #[test]
    fn test_only_single_face_frames_count() {
        let store = empty_store();
        let device = ScriptedDevice::looping(vec![
            FrameSpec::face(1),
            FrameSpec::empty(),
            FrameSpec::crowd(1, 3),
        ]);
        let outcome = run(&device, &store, "alice", 30);
        assert!(matches!(outcome, Outcome::Enrolled { samples: 30, label: Label(0), .. }));

        let guard = store::lock(&store);
        assert_eq!(guard.sample_count(), 30);
        assert!(guard.data().labels.iter().all(|&l| l == Label(0)));
        assert_eq!(guard.username_for(Label(0)), Some("alice"));
    }

    #[test]
    fn test_short_stream_commits_nothing() {
        let store = empty_store();
        let device = ScriptedDevice::once(vec![FrameSpec::face(1); 5]);
        let outcome = run(&device, &store, "alice", 30);
        assert!(matches!(outcome, Outcome::Failed(EngineError::SourceExhausted)));
        assert!(!store::lock(&store).has_identities());
    }

    #[test]
    fn test_store_rejection_is_failure() {
        let store = empty_store();
        let device = ScriptedDevice::looping(vec![FrameSpec::face(1)]);
        run(&device, &store, "alice", 3);
        let outcome = run(&device, &store, "alice", 3);
        assert!(matches!(outcome, Outcome::Failed(EngineError::Store(_))));
        assert_eq!(store::lock(&store).sample_count(), 3);
    }
}
