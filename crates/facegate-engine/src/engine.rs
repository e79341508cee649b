//! Worker facade: one enrollment or authentication run at a time on a
//! dedicated thread, reporting through tokio channels.

use crate::authenticate::run_authenticate;
use crate::config::Config;
use crate::decision::DecisionMachine;
use crate::enroll::run_enroll;
use crate::pipeline::{FrameEvent, PipelineContext};
use crate::store::{self, ModelStore, SharedStore, StoreError};
use facegate_core::{FaceLocator, HaarCascade, Label, LocatorError, Sensitivity};
use facegate_hw::{CameraError, FrameSource, V4lDevice, VideoDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("model store error: {0}")]
    Store(#[from] StoreError),
    #[error("another capture is already running")]
    Busy,
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),
    #[error("username already registered: {0}")]
    DuplicateUsername(String),
    #[error("frame source ended before the run completed")]
    SourceExhausted,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine worker exited without a result")]
    ChannelClosed,
}

/// Terminal result of one worker run. Exactly one is produced per run.
#[derive(Debug)]
pub enum Outcome {
    Authenticated {
        username: String,
    },
    Enrolled {
        username: String,
        label: Label,
        samples: usize,
    },
    Cancelled,
    Failed(EngineError),
}

/// Tunables shared by both pipelines.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sensitivity: Sensitivity,
    pub rejection_threshold: f64,
    pub quorum: u32,
    pub batch_size: usize,
    pub frame_interval: Duration,
    pub frame_channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            sensitivity: config.sensitivity(),
            rejection_threshold: config.rejection_threshold,
            quorum: config.quorum,
            batch_size: config.batch_size,
            frame_interval: config.frame_interval(),
            frame_channel_capacity: config.frame_channel_capacity.max(1),
        }
    }
}

/// Clears the busy flag when the owning run ends, on every exit path.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::Busy)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cancellation flag shared with a running worker.
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Observed before the next frame poll.
    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Consumer side of a running worker: preview frames plus one terminal
/// [`Outcome`]. Dropping the handle cancels the run.
pub struct WorkerHandle {
    cancel: CancelToken,
    frames: mpsc::Receiver<FrameEvent>,
    result: Option<oneshot::Receiver<Outcome>>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next preview frame; `None` once the worker has exited.
    pub async fn next_frame(&mut self) -> Option<FrameEvent> {
        self.frames.recv().await
    }

    pub async fn finish(mut self) -> Outcome {
        match self.result.take() {
            Some(rx) => rx.await.unwrap_or(Outcome::Failed(EngineError::ChannelClosed)),
            None => Outcome::Failed(EngineError::ChannelClosed),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs enrollment or authentication on a dedicated worker thread, one at
/// a time, against a shared model store.
pub struct Engine {
    device: Arc<dyn VideoDevice>,
    locator: Arc<dyn FaceLocator>,
    store: SharedStore,
    settings: PipelineSettings,
    busy: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        device: Arc<dyn VideoDevice>,
        locator: Arc<dyn FaceLocator>,
        store: SharedStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            device,
            locator,
            store,
            settings,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the production engine: V4L2 camera, Haar cascade, on-disk store.
    ///
    /// The camera is not opened until a run starts. A corrupt data file does
    /// not prevent startup: the store opens empty and every frame reports
    /// that no identities are registered.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let device = V4lDevice {
            path: config.camera_device.clone(),
            width: config.frame_width,
            height: config.frame_height,
            warmup_frames: config.warmup_frames,
        };
        let cascade = HaarCascade::load(&config.cascade_path())?;
        let store = ModelStore::open_fail_closed(config.store_paths())?;
        if store.needs_rebuild() {
            tracing::warn!("classifier artifact missing or stale; run rebuild");
        }

        Ok(Self::new(
            Arc::new(device),
            Arc::new(cascade),
            Arc::new(Mutex::new(store)),
            PipelineSettings::from(config),
        ))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start capturing an enrollment batch for a new username.
    pub fn start_enroll(&self, username: &str) -> Result<WorkerHandle, EngineError> {
        if username.trim().is_empty() {
            return Err(EngineError::InvalidUsername(username.to_string()));
        }
        {
            let store = store::lock(&self.store);
            if let Some(reason) = store.corruption() {
                return Err(StoreError::Corrupt(reason.to_string()).into());
            }
            if store.contains_username(username) {
                return Err(EngineError::DuplicateUsername(username.to_string()));
            }
        }

        let store = Arc::clone(&self.store);
        let username = username.to_string();
        let batch_size = self.settings.batch_size;
        self.spawn("enroll", move |source, ctx| {
            run_enroll(source, ctx, &store, &username, batch_size)
        })
    }

    /// Start scanning for an enrolled face.
    pub fn start_authenticate(&self) -> Result<WorkerHandle, EngineError> {
        let store = Arc::clone(&self.store);
        let machine = DecisionMachine::new(self.settings.rejection_threshold, self.settings.quorum);
        self.spawn("authenticate", move |source, ctx| {
            run_authenticate(source, ctx, &store, machine)
        })
    }

    /// Delete an identity. Refused while a run is active.
    pub fn delete_identity(&self, label: Label) -> Result<String, EngineError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        Ok(store::lock(&self.store).delete(label)?)
    }

    /// Retrain the classifier from persisted data. Refused while a run is active.
    pub fn rebuild(&self) -> Result<usize, EngineError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        Ok(store::lock(&self.store).rebuild()?)
    }

    fn spawn<F>(&self, mode: &'static str, job: F) -> Result<WorkerHandle, EngineError>
    where
        F: FnOnce(&mut dyn FrameSource, &PipelineContext<'_>) -> Outcome + Send + 'static,
    {
        let guard = BusyGuard::acquire(&self.busy)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel(self.settings.frame_channel_capacity);
        let (result_tx, result_rx) = oneshot::channel();

        let device = Arc::clone(&self.device);
        let locator = Arc::clone(&self.locator);
        let worker_cancel = Arc::clone(&cancel);
        let sensitivity = self.settings.sensitivity;
        let frame_interval = self.settings.frame_interval;

        std::thread::Builder::new()
            .name(format!("facegate-{mode}"))
            .spawn(move || {
                let outcome = match device.open() {
                    Ok(mut source) => {
                        tracing::info!(device = %device.describe(), mode, "worker started");
                        let ctx = PipelineContext {
                            locator: locator.as_ref(),
                            sensitivity,
                            frame_interval,
                            cancel: &worker_cancel,
                            events: &frame_tx,
                        };
                        job(source.as_mut(), &ctx)
                    }
                    Err(e) => {
                        tracing::error!(device = %device.describe(), error = %e, "failed to open camera");
                        Outcome::Failed(e.into())
                    }
                };
                // The source is already closed; free the engine before reporting.
                drop(guard);
                tracing::info!(mode, ?outcome, "worker exiting");
                let _ = result_tx.send(outcome);
            })
            .map_err(EngineError::Spawn)?;

        Ok(WorkerHandle {
            cancel: CancelToken(cancel),
            frames: frame_rx,
            result: Some(result_rx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::FrameVerdict;
    use crate::pipeline::FrameStatus;
    use crate::store::StorePaths;
    use crate::testing::{FakeLocator, FrameSpec, ScriptedDevice};

    fn settings() -> PipelineSettings {
        PipelineSettings {
            frame_interval: Duration::from_millis(1),
            ..PipelineSettings::default()
        }
    }

    fn shared_store() -> SharedStore {
        let dir = crate::store::tests::scratch_dir();
        Arc::new(Mutex::new(ModelStore::open(StorePaths::in_dir(&dir)).unwrap()))
    }

    fn engine(device: ScriptedDevice, store: &SharedStore) -> Engine {
        Engine::new(Arc::new(device), Arc::new(FakeLocator), Arc::clone(store), settings())
    }

    async fn wait_idle(engine: &Engine) {
        for _ in 0..400 {
            if !engine.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine stayed busy");
    }

    #[tokio::test]
    async fn test_enroll_then_authenticate() {
        let store = shared_store();

        let enroller = engine(
            ScriptedDevice::looping(vec![FrameSpec::face(1), FrameSpec::empty(), FrameSpec::crowd(1, 2)]),
            &store,
        );
        let outcome = enroller.start_enroll("alice").unwrap().finish().await;
        assert!(matches!(outcome, Outcome::Enrolled { samples: 30, .. }), "{outcome:?}");

        let enroller = engine(ScriptedDevice::looping(vec![FrameSpec::face(2)]), &store);
        let outcome = enroller.start_enroll("bob").unwrap().finish().await;
        assert!(matches!(outcome, Outcome::Enrolled { samples: 30, .. }), "{outcome:?}");
        assert_eq!(store::lock(&store).classifier().unwrap().sample_count(), 60);

        let scanner = engine(ScriptedDevice::looping(vec![FrameSpec::face(1)]), &store);
        let mut handle = scanner.start_authenticate().unwrap();
        let mut statuses = Vec::new();
        while let Some(event) = handle.next_frame().await {
            statuses.push(event.status);
        }
        let outcome = handle.finish().await;
        assert!(matches!(outcome, Outcome::Authenticated { ref username } if username == "alice"));
        assert!(matches!(
            statuses.last(),
            Some(FrameStatus::Authenticating(FrameVerdict::Accepted { .. }))
        ));
        assert!(!scanner.is_busy());
    }

    #[tokio::test]
    async fn test_second_run_is_refused_until_first_ends() {
        let store = shared_store();
        let engine = engine(ScriptedDevice::looping(vec![FrameSpec::face(1)]), &store);

        let handle = engine.start_authenticate().unwrap();
        assert!(matches!(engine.start_enroll("alice"), Err(EngineError::Busy)));
        assert!(matches!(engine.rebuild(), Err(EngineError::Busy)));

        handle.cancel();
        assert!(matches!(handle.finish().await, Outcome::Cancelled));
        assert!(!engine.is_busy());

        let again = engine.start_authenticate().unwrap();
        again.cancel();
        assert!(matches!(again.finish().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let store = shared_store();
        let engine = engine(ScriptedDevice::looping(vec![FrameSpec::empty()]), &store);
        drop(engine.start_authenticate().unwrap());
        wait_idle(&engine).await;
    }

    #[tokio::test]
    async fn test_camera_failure_is_terminal_for_the_run() {
        let store = shared_store();
        let engine = engine(ScriptedDevice::broken(), &store);
        let outcome = engine.start_authenticate().unwrap().finish().await;
        assert!(matches!(outcome, Outcome::Failed(EngineError::Camera(_))));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_username_preconditions() {
        let store = shared_store();
        store::lock(&store)
            .enroll("alice", vec![crate::store::tests::textured(1)])
            .unwrap();
        let engine = engine(ScriptedDevice::looping(vec![FrameSpec::face(1)]), &store);

        assert!(matches!(engine.start_enroll("  "), Err(EngineError::InvalidUsername(_))));
        assert!(matches!(engine.start_enroll("alice"), Err(EngineError::DuplicateUsername(_))));
        assert!(!engine.is_busy());
    }

    /// Run to completion; the camera must be closed by the time the outcome arrives.
    async fn run_to_end(
        device: ScriptedDevice,
        store: &SharedStore,
        start: impl FnOnce(&Engine) -> Result<WorkerHandle, EngineError>,
        cancel: bool,
    ) -> Outcome {
        let open = device.open_sources();
        let engine = engine(device, store);
        let handle = start(&engine).unwrap();
        if cancel {
            handle.cancel();
        }
        let outcome = handle.finish().await;
        assert_eq!(open.load(Ordering::SeqCst), 0, "camera still open after {outcome:?}");
        outcome
    }

    #[tokio::test]
    async fn test_camera_released_before_every_outcome() {
        let store = shared_store();

        let outcome = run_to_end(
            ScriptedDevice::looping(vec![FrameSpec::face(1)]),
            &store,
            |e| e.start_enroll("alice"),
            false,
        )
        .await;
        assert!(matches!(outcome, Outcome::Enrolled { .. }), "{outcome:?}");

        let outcome = run_to_end(
            ScriptedDevice::looping(vec![FrameSpec::face(1)]),
            &store,
            |e| e.start_authenticate(),
            false,
        )
        .await;
        assert!(matches!(outcome, Outcome::Authenticated { .. }), "{outcome:?}");

        let outcome = run_to_end(
            ScriptedDevice::looping(vec![FrameSpec::empty()]),
            &store,
            |e| e.start_authenticate(),
            true,
        )
        .await;
        assert!(matches!(outcome, Outcome::Cancelled), "{outcome:?}");

        let outcome = run_to_end(
            ScriptedDevice::once(vec![FrameSpec::face(2); 2]),
            &store,
            |e| e.start_enroll("bob"),
            false,
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed(EngineError::SourceExhausted)), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_camera_released_when_enrollment_fails_to_persist() {
        let paths = StorePaths::in_dir(&crate::store::tests::scratch_dir());
        // A non-empty directory where the artifact goes makes the final rename fail.
        std::fs::create_dir_all(paths.model.join("blocker")).unwrap();
        let store = Arc::new(Mutex::new(ModelStore::open(paths).unwrap()));

        let outcome = run_to_end(
            ScriptedDevice::looping(vec![FrameSpec::face(3)]),
            &store,
            |e| e.start_enroll("carol"),
            false,
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed(EngineError::Store(_))), "{outcome:?}");
        assert!(!store::lock(&store).has_identities());
    }

    fn corrupt_store() -> (SharedStore, StorePaths) {
        let paths = StorePaths::in_dir(&crate::store::tests::scratch_dir());
        std::fs::write(&paths.data, b"\x00garbage").unwrap();
        let store = ModelStore::open_fail_closed(paths.clone()).unwrap();
        (Arc::new(Mutex::new(store)), paths)
    }

    #[tokio::test]
    async fn test_corrupt_store_authenticates_nobody() {
        let (store, _) = corrupt_store();
        let engine = engine(ScriptedDevice::looping(vec![FrameSpec::face(1)]), &store);

        let mut handle = engine.start_authenticate().unwrap();
        for _ in 0..3 {
            let event = handle.next_frame().await.unwrap();
            assert!(
                matches!(event.status, FrameStatus::Authenticating(FrameVerdict::NoIdentities)),
                "{:?}",
                event.status
            );
        }
        handle.cancel();
        assert!(matches!(handle.finish().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_corrupt_store_refuses_enroll() {
        let (store, paths) = corrupt_store();
        let engine = engine(ScriptedDevice::looping(vec![FrameSpec::face(1)]), &store);

        assert!(matches!(
            engine.start_enroll("alice"),
            Err(EngineError::Store(StoreError::Corrupt(_)))
        ));
        assert!(!engine.is_busy());
        assert_eq!(std::fs::read(&paths.data).unwrap(), b"\x00garbage");
    }

    #[test]
    fn test_from_config_tolerates_corrupt_store() {
        let dir = crate::store::tests::scratch_dir();
        let cascade = dir.join("cascade.json");
        std::fs::write(
            &cascade,
            r#"{"window_width": 4, "window_height": 4, "stages": [{"threshold": 0.0, "stumps": [
                {"rects": [{"x": 0, "y": 0, "width": 4, "height": 4, "weight": 1.0}],
                 "threshold": 0.0, "left": 0.0, "right": 1.0}]}]}"#,
        )
        .unwrap();
        let config = Config {
            data_dir: dir.clone(),
            cascade_path: Some(cascade),
            ..Config::default()
        };
        std::fs::write(&config.store_paths().data, b"\x00garbage").unwrap();

        let engine = Engine::from_config(&config).unwrap();
        let summary = store::lock(engine.store()).summary();
        assert!(summary.identities.is_empty());
        assert!(summary.corruption.is_some());
    }

    #[tokio::test]
    async fn test_management_operations() {
        let store = shared_store();
        let label = store::lock(&store)
            .enroll("alice", vec![crate::store::tests::textured(1); 2])
            .unwrap();
        let engine = engine(ScriptedDevice::broken(), &store);

        assert_eq!(engine.rebuild().unwrap(), 2);
        assert_eq!(engine.delete_identity(label).unwrap(), "alice");
        assert!(matches!(
            engine.delete_identity(label),
            Err(EngineError::Store(StoreError::UnknownLabel(_)))
        ));
        assert!(!engine.is_busy());
    }
}
