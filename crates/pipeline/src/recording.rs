//! Recording state machine driven once per render tick.
//!
//! | state     | requested | effect                                   | next    |
//! |-----------|-----------|------------------------------------------|---------|
//! | `Off`     | `true`    | `start_session`                          | `On`    |
//! | `Resumed` | `true`    | `update_shared_context`                  | `On`    |
//! | `On`      | `true`    | none                                     | `On`    |
//! | `On`      | `false`   | `stop_session`                           | `Off`   |
//! | `Resumed` | `false`   | `stop_session`                           | `Off`   |
//! | `Off`     | `false`   | none                                     | `Off`   |
//!
//! Before a render context exists the controller has no state at all, and
//! stepping it is an [`PipelineError::InvariantViolation`].

use std::fmt;

use crate::encoder::{EncoderCollaborator, EncoderSession, SessionTemplate};
use crate::error::PipelineError;
use crate::types::{ContextRef, PreviewGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Off,
    On,
    /// A session survived a render-context recreation and still points at
    /// the old context.
    Resumed,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingState::Off => f.write_str("off"),
            RecordingState::On => f.write_str("on"),
            RecordingState::Resumed => f.write_str("resumed"),
        }
    }
}

/// Collaborator call issued by one [`RecordingSessionController::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingAction {
    #[default]
    Unchanged,
    Started,
    Resumed,
    Stopped,
}

#[derive(Debug, Default)]
pub struct RecordingSessionController {
    state: Option<RecordingState>,
}

impl RecordingSessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<RecordingState> {
        self.state
    }

    /// Seeds the state for a freshly created render context.
    pub fn on_context_created(&mut self, session_active: bool) -> RecordingState {
        let state = if session_active {
            RecordingState::Resumed
        } else {
            RecordingState::Off
        };
        self.state = Some(state);
        state
    }

    pub fn on_context_lost(&mut self) {
        self.state = None;
    }

    /// Runs one transition for this tick.
    ///
    /// `geometry` is the geometry a newly started session records at and
    /// `context` the render context the encoder shares objects with. A
    /// failing `start_session` leaves the state at `Off`.
    pub fn step(
        &mut self,
        requested: bool,
        encoder: &dyn EncoderCollaborator,
        template: &SessionTemplate,
        geometry: Option<PreviewGeometry>,
        context: &ContextRef,
    ) -> Result<RecordingAction, PipelineError> {
        let Some(state) = self.state else {
            return Err(PipelineError::invariant(format!(
                "recording step (requested={requested}) before a render context was created"
            )));
        };

        let (next, action) = match (state, requested) {
            (RecordingState::Off, true) => {
                let geometry = geometry.unwrap_or(template.fallback_geometry);
                let session = EncoderSession {
                    output: template.output.clone(),
                    geometry,
                    bitrate: template.bitrate,
                    context: context.clone(),
                };
                tracing::info!(
                    output = %session.output.display(),
                    %geometry,
                    bitrate = session.bitrate,
                    context = %context.id(),
                    "starting recording"
                );
                encoder.start_session(session)?;
                (RecordingState::On, RecordingAction::Started)
            }
            (RecordingState::Resumed, true) => {
                tracing::info!(context = %context.id(), "resuming recording");
                encoder.update_shared_context(context.clone());
                (RecordingState::On, RecordingAction::Resumed)
            }
            (RecordingState::On | RecordingState::Resumed, false) => {
                tracing::info!("stopping recording");
                encoder.stop_session();
                (RecordingState::Off, RecordingAction::Stopped)
            }
            (RecordingState::On, true) | (RecordingState::Off, false) => {
                (state, RecordingAction::Unchanged)
            }
        };

        self.state = Some(next);
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::types::{ContextId, SharedTextureHandle};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(PreviewGeometry, u32),
        Update(ContextId),
        Stop,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail_start: bool,
    }

    impl EncoderCollaborator for Recorder {
        fn is_session_active(&self) -> bool {
            false
        }

        fn start_session(&self, session: EncoderSession) -> Result<(), PipelineError> {
            if self.fail_start {
                return Err(PipelineError::EncoderInitFailed("no codec".into()));
            }
            self.calls
                .lock()
                .push(Call::Start(session.geometry, session.bitrate));
            Ok(())
        }

        fn update_shared_context(&self, context: ContextRef) {
            self.calls.lock().push(Call::Update(context.id()));
        }

        fn set_frame_source_identity(&self, _texture: &SharedTextureHandle) {}

        fn notify_frame_ready(&self, _texture: &SharedTextureHandle) {}

        fn stop_session(&self) {
            self.calls.lock().push(Call::Stop);
        }
    }

    fn template() -> SessionTemplate {
        SessionTemplate {
            output: PathBuf::from("out.mp4"),
            bitrate: 1_000_000,
            fallback_geometry: PreviewGeometry::new(640, 480),
        }
    }

    fn context() -> ContextRef {
        ContextRef::new(ContextId::next(), Arc::new(()))
    }

    fn run(
        initial: RecordingState,
        requested: bool,
    ) -> (Option<RecordingState>, RecordingAction, Vec<Call>) {
        let encoder = Recorder::default();
        let mut controller = RecordingSessionController::new();
        controller.state = Some(initial);
        let action = controller
            .step(
                requested,
                &encoder,
                &template(),
                Some(PreviewGeometry::new(1280, 720)),
                &context(),
            )
            .unwrap();
        let calls = encoder.calls.lock().clone();
        (controller.state(), action, calls)
    }

    #[test]
    fn transition_table() {
        use RecordingState::*;

        let (state, action, calls) = run(Off, true);
        assert_eq!(state, Some(On));
        assert_eq!(action, RecordingAction::Started);
        assert_eq!(
            calls,
            vec![Call::Start(PreviewGeometry::new(1280, 720), 1_000_000)]
        );

        let (state, action, calls) = run(Resumed, true);
        assert_eq!(state, Some(On));
        assert_eq!(action, RecordingAction::Resumed);
        assert!(matches!(calls.as_slice(), [Call::Update(_)]));

        let (state, action, calls) = run(On, true);
        assert_eq!((state, action), (Some(On), RecordingAction::Unchanged));
        assert!(calls.is_empty());

        for from in [On, Resumed] {
            let (state, action, calls) = run(from, false);
            assert_eq!((state, action), (Some(Off), RecordingAction::Stopped));
            assert_eq!(calls, vec![Call::Stop]);
        }

        let (state, action, calls) = run(Off, false);
        assert_eq!((state, action), (Some(Off), RecordingAction::Unchanged));
        assert!(calls.is_empty());
    }

    #[test]
    fn stepping_without_a_context_is_an_invariant_violation() {
        let encoder = Recorder::default();
        let mut controller = RecordingSessionController::new();
        for requested in [true, false] {
            let err = controller
                .step(requested, &encoder, &template(), None, &context())
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvariantViolation(_)));
        }
        assert!(encoder.calls.lock().is_empty());
    }

    #[test]
    fn initial_state_follows_encoder_activity() {
        let mut controller = RecordingSessionController::new();
        assert_eq!(controller.on_context_created(true), RecordingState::Resumed);
        assert_eq!(controller.on_context_created(false), RecordingState::Off);
        controller.on_context_lost();
        assert_eq!(controller.state(), None);
    }

    #[test]
    fn unknown_geometry_falls_back_to_template() {
        let encoder = Recorder::default();
        let mut controller = RecordingSessionController::new();
        controller.on_context_created(false);
        controller
            .step(true, &encoder, &template(), None, &context())
            .unwrap();
        assert_eq!(
            encoder.calls.lock().as_slice(),
            &[Call::Start(PreviewGeometry::new(640, 480), 1_000_000)]
        );
    }

    #[test]
    fn failed_start_stays_off() {
        let encoder = Recorder {
            fail_start: true,
            ..Recorder::default()
        };
        let mut controller = RecordingSessionController::new();
        controller.on_context_created(false);
        let err = controller
            .step(true, &encoder, &template(), None, &context())
            .unwrap_err();
        assert!(matches!(err, PipelineError::EncoderInitFailed(_)));
        assert_eq!(controller.state(), Some(RecordingState::Off));
    }
}
