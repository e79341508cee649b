//! Authentication pipeline: classify each frame and feed the decision
//! machine until it accepts or the run is stopped.

use crate::decision::{AuthState, DecisionMachine, FrameOutcome};
use crate::engine::Outcome;
use crate::pipeline::{scan_frame, FaceScan, FrameStatus, PipelineContext, Poll};
use crate::store::{self, SharedStore};
use facegate_hw::FrameSource;

pub fn run_authenticate(
    source: &mut dyn FrameSource,
    ctx: &PipelineContext<'_>,
    store: &SharedStore,
    mut machine: DecisionMachine,
) -> Outcome {
    machine.start();
    tracing::info!("authentication scanning");

    loop {
        let frame = match ctx.poll(source) {
            Poll::Frame(frame) => frame,
            Poll::Stop(outcome) => {
                machine.stop();
                return outcome;
            }
        };

        let gray = frame.to_grayscale();
        let (faces, scan) = scan_frame(&gray, ctx.locator, &ctx.sensitivity);
        let verdict = machine.observe(classify(store, scan));
        tracing::debug!(sequence = frame.sequence, ?verdict, "frame verdict");
        ctx.emit(frame, faces, FrameStatus::Authenticating(verdict));

        if let AuthState::Accepted(username) = machine.state() {
            tracing::info!(username = %username, "authenticated");
            return Outcome::Authenticated {
                username: username.clone(),
            };
        }
        ctx.pause();
    }
}

/// Turn a face scan into a policy input, consulting the store under its lock.
fn classify(store: &SharedStore, scan: FaceScan) -> FrameOutcome {
    let store = store::lock(store);
    if store.classifier().is_none() {
        return FrameOutcome::NoIdentities;
    }
    match scan {
        FaceScan::None => FrameOutcome::NoFace,
        FaceScan::Multiple(n) => FrameOutcome::MultipleFaces(n),
        FaceScan::Single { template, .. } => match store.predict(&template) {
            Some(Ok(prediction)) => FrameOutcome::Predicted {
                label: prediction.label,
                username: store.username_for(prediction.label).map(str::to_string),
                score: prediction.score,
            },
            Some(Err(e)) => FrameOutcome::PredictFailed(e.to_string()),
            None => FrameOutcome::NoIdentities,
        },
    }
}
