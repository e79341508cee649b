//! Authentication decision state machine.
//!
//! Requires `quorum` consecutive frames that each match the same username
//! with a score below the rejection threshold. Any other frame (no face,
//! several faces, a poor score, an unknown label, a prediction error, or no
//! trained model) breaks the streak.

use facegate_core::Label;

/// What one processed frame produced, before any policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No classifier is available.
    NoIdentities,
    NoFace,
    MultipleFaces(usize),
    /// The classifier ran; `username` is `None` when the label is unregistered.
    Predicted {
        label: Label,
        username: Option<String>,
        score: f64,
    },
    PredictFailed(String),
}

/// Per-frame decision.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameVerdict {
    NoIdentities,
    /// Zero or several faces in the frame.
    Skipped { faces: usize },
    /// Best match scored at or above the rejection threshold.
    Rejected { score: f64 },
    UnknownLabel { label: Label },
    PredictFailed,
    /// Below threshold; `streak` consecutive matches for `username` so far.
    Candidate {
        username: String,
        streak: u32,
        score: f64,
    },
    Accepted { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    Scanning,
    Accepted(String),
    Stopped,
}

#[derive(Debug)]
pub struct DecisionMachine {
    rejection_threshold: f64,
    quorum: u32,
    state: AuthState,
    streak: Option<(String, u32)>,
}

impl DecisionMachine {
    pub fn new(rejection_threshold: f64, quorum: u32) -> Self {
        Self {
            rejection_threshold,
            quorum: quorum.max(1),
            state: AuthState::Idle,
            streak: None,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Begin scanning. No effect once terminal.
    pub fn start(&mut self) {
        if self.state == AuthState::Idle {
            self.state = AuthState::Scanning;
        }
    }

    /// Caller cancellation. An accepted run stays accepted.
    pub fn stop(&mut self) {
        if !matches!(self.state, AuthState::Accepted(_)) {
            self.state = AuthState::Stopped;
            self.streak = None;
        }
    }

    /// Apply the policy to one frame. Observing from `Idle` starts scanning;
    /// observations after a terminal state change nothing.
    pub fn observe(&mut self, outcome: FrameOutcome) -> FrameVerdict {
        if let AuthState::Accepted(username) = &self.state {
            return FrameVerdict::Accepted {
                username: username.clone(),
            };
        }
        if self.state == AuthState::Stopped {
            return FrameVerdict::Skipped { faces: 0 };
        }
        self.state = AuthState::Scanning;

        let verdict = match outcome {
            FrameOutcome::NoIdentities => FrameVerdict::NoIdentities,
            FrameOutcome::NoFace => FrameVerdict::Skipped { faces: 0 },
            FrameOutcome::MultipleFaces(faces) => FrameVerdict::Skipped { faces },
            FrameOutcome::PredictFailed(reason) => {
                tracing::warn!(reason = %reason, "prediction failed; treating frame as non-match");
                FrameVerdict::PredictFailed
            }
            FrameOutcome::Predicted { score, .. } if score >= self.rejection_threshold => {
                FrameVerdict::Rejected { score }
            }
            FrameOutcome::Predicted {
                label,
                username: None,
                ..
            } => {
                tracing::warn!(%label, "prediction for unregistered label");
                FrameVerdict::UnknownLabel { label }
            }
            FrameOutcome::Predicted {
                username: Some(username),
                score,
                ..
            } => {
                let streak = match self.streak.take() {
                    Some((prev, n)) if prev == username => n + 1,
                    _ => 1,
                };
                if streak >= self.quorum {
                    self.state = AuthState::Accepted(username.clone());
                    return FrameVerdict::Accepted { username };
                }
                self.streak = Some((username.clone(), streak));
                return FrameVerdict::Candidate {
                    username,
                    streak,
                    score,
                };
            }
        };

        self.streak = None;
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(username: &str, score: f64) -> FrameOutcome {
        FrameOutcome::Predicted {
            label: Label(if username == "alice" { 0 } else { 1 }),
            username: Some(username.to_string()),
            score,
        }
    }

    fn run(machine: &mut DecisionMachine, frames: Vec<FrameOutcome>) -> Vec<FrameVerdict> {
        frames.into_iter().map(|f| machine.observe(f)).collect()
    }

    #[test]
    fn test_quorum_consecutive_accepts() {
        let mut m = DecisionMachine::new(80.0, 3);
        let verdicts = run(&mut m, vec![hit("alice", 10.0), hit("alice", 20.0), hit("alice", 79.9)]);
        assert_eq!(
            verdicts.last(),
            Some(&FrameVerdict::Accepted {
                username: "alice".into()
            })
        );
        assert_eq!(m.state(), &AuthState::Accepted("alice".into()));
    }

    #[test]
    fn test_fewer_than_quorum_never_accepts() {
        let mut m = DecisionMachine::new(80.0, 3);
        let frames = vec![
            hit("alice", 10.0),
            hit("alice", 10.0),
            hit("alice", 80.0),
            hit("alice", 10.0),
            FrameOutcome::NoFace,
            hit("alice", 10.0),
            hit("alice", 10.0),
            FrameOutcome::MultipleFaces(2),
            hit("alice", 10.0),
            FrameOutcome::PredictFailed("boom".into()),
            hit("alice", 10.0),
            hit("alice", 10.0),
        ];
        run(&mut m, frames);
        assert_eq!(m.state(), &AuthState::Scanning);
    }

    #[test]
    fn test_alternating_identities_never_accumulate() {
        let mut m = DecisionMachine::new(80.0, 3);
        for _ in 0..20 {
            m.observe(hit("alice", 1.0));
            m.observe(hit("bob", 1.0));
        }
        assert_eq!(m.state(), &AuthState::Scanning);
    }

    #[test]
    fn test_identity_switch_restarts_streak() {
        let mut m = DecisionMachine::new(80.0, 3);
        run(&mut m, vec![hit("alice", 1.0), hit("alice", 1.0)]);
        assert_eq!(
            m.observe(hit("bob", 1.0)),
            FrameVerdict::Candidate {
                username: "bob".into(),
                streak: 1,
                score: 1.0
            }
        );
        run(&mut m, vec![hit("bob", 1.0), hit("bob", 1.0)]);
        assert_eq!(m.state(), &AuthState::Accepted("bob".into()));
    }

    #[test]
    fn test_unknown_label_is_non_match() {
        let mut m = DecisionMachine::new(80.0, 2);
        m.observe(hit("alice", 1.0));
        let unknown = FrameOutcome::Predicted {
            label: Label(9),
            username: None,
            score: 1.0,
        };
        assert_eq!(m.observe(unknown), FrameVerdict::UnknownLabel { label: Label(9) });
        assert!(matches!(m.observe(hit("alice", 1.0)), FrameVerdict::Candidate { streak: 1, .. }));
    }

    #[test]
    fn test_no_identities_stays_scanning() {
        let mut m = DecisionMachine::new(80.0, 1);
        for _ in 0..5 {
            assert_eq!(m.observe(FrameOutcome::NoIdentities), FrameVerdict::NoIdentities);
        }
        assert_eq!(m.state(), &AuthState::Scanning);
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut m = DecisionMachine::new(80.0, 1);
        m.start();
        m.stop();
        m.observe(hit("alice", 1.0));
        assert_eq!(m.state(), &AuthState::Stopped);
    }

    #[test]
    fn test_quorum_of_one() {
        let mut m = DecisionMachine::new(80.0, 1);
        assert!(matches!(m.observe(hit("bob", 5.0)), FrameVerdict::Accepted { .. }));
        m.stop();
        assert_eq!(m.state(), &AuthState::Accepted("bob".into()));
    }
}
