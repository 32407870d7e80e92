//! Encoder execution context.
//!
//! The renderer talks to the encoder only through [`EncoderCollaborator`].
//! [`EncoderWorker`] is the threaded implementation: it owns a [`VideoSink`]
//! (the code that actually encodes and writes) on its own thread and feeds it
//! from a command channel, so render ticks never wait on encoding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::types::{ContextRef, PreviewGeometry, SharedTextureHandle};

pub const DEFAULT_OUTPUT: &str = "camera-test.mp4";
pub const DEFAULT_BITRATE: u32 = 1_000_000;
pub const FALLBACK_GEOMETRY: PreviewGeometry = PreviewGeometry::new(640, 480);

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSession {
    pub output: PathBuf,
    pub geometry: PreviewGeometry,
    pub bitrate: u32,
    /// Render context the encoder's own context shares objects with.
    pub context: ContextRef,
}

/// Fixed parameters every new session is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTemplate {
    pub output: PathBuf,
    pub bitrate: u32,
    /// Used when recording starts before the preview geometry is known.
    pub fallback_geometry: PreviewGeometry,
}

impl Default for SessionTemplate {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            bitrate: DEFAULT_BITRATE,
            fallback_geometry: FALLBACK_GEOMETRY,
        }
    }
}

/// What the render context may ask of the encoder.
///
/// Every call except [`start_session`](Self::start_session) is fire and
/// forget.
pub trait EncoderCollaborator: Send + Sync {
    /// Whether a session is in progress; read at render-context creation.
    fn is_session_active(&self) -> bool;

    fn start_session(&self, session: EncoderSession) -> Result<(), PipelineError>;

    /// Re-points a surviving session at a recreated render context.
    fn update_shared_context(&self, context: ContextRef);

    fn set_frame_source_identity(&self, texture: &SharedTextureHandle);

    /// Dropped when no session is active.
    fn notify_frame_ready(&self, texture: &SharedTextureHandle);

    fn stop_session(&self);
}

/// Encodes frames read through the shared context and writes the container.
pub trait VideoSink: Send + 'static {
    fn begin(&mut self, session: &EncoderSession) -> anyhow::Result<()>;

    fn update_context(&mut self, context: &ContextRef) -> anyhow::Result<()>;

    fn encode_frame(&mut self, texture: &SharedTextureHandle) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub frames_encoded: u64,
    /// Frame-ready signals that arrived with no session or no texture identity.
    pub frames_ignored: u64,
    pub encode_errors: u64,
    pub context_updates: u64,
}

enum EncoderCommand {
    Start {
        session: EncoderSession,
        ack: Sender<Result<(), PipelineError>>,
    },
    UpdateContext(ContextRef),
    SetTexture(SharedTextureHandle),
    FrameReady(SharedTextureHandle),
    Stop,
    Stats(Sender<EncoderStats>),
    Shutdown,
}

pub struct EncoderWorker {
    tx: Sender<EncoderCommand>,
    active: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EncoderWorker {
    pub fn spawn<S: VideoSink>(sink: S) -> Result<Self, PipelineError> {
        let (tx, rx) = unbounded();
        let active = Arc::new(AtomicBool::new(false));
        let flag = active.clone();
        let handle = thread::Builder::new()
            .name("dualcam-encoder".into())
            .spawn(move || run_encoder_thread(sink, rx, flag))
            .map_err(|err| PipelineError::ThreadSpawn {
                name: "encoder",
                reason: err.to_string(),
            })?;

        Ok(Self {
            tx,
            active,
            join_handle: Mutex::new(Some(handle)),
        })
    }

    /// Counters as of every command sent before this call.
    pub fn stats(&self) -> Result<EncoderStats, PipelineError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(EncoderCommand::Stats(ack_tx))
            .map_err(|_| PipelineError::Disconnected("encoder"))?;
        ack_rx
            .recv()
            .map_err(|_| PipelineError::Disconnected("encoder"))
    }

    /// Finishes any open session and joins the encoder thread.
    pub fn shutdown(&self) {
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = self.tx.send(EncoderCommand::Shutdown);
            if handle.join().is_err() {
                tracing::error!("encoder thread panicked");
            }
        }
    }

    fn send(&self, command: EncoderCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("encoder thread is gone; dropping command");
        }
    }
}

impl EncoderCollaborator for EncoderWorker {
    fn is_session_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn start_session(&self, session: EncoderSession) -> Result<(), PipelineError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(EncoderCommand::Start {
                session,
                ack: ack_tx,
            })
            .map_err(|_| PipelineError::Disconnected("encoder"))?;
        ack_rx
            .recv()
            .map_err(|_| PipelineError::Disconnected("encoder"))?
    }

    fn update_shared_context(&self, context: ContextRef) {
        self.send(EncoderCommand::UpdateContext(context));
    }

    fn set_frame_source_identity(&self, texture: &SharedTextureHandle) {
        self.send(EncoderCommand::SetTexture(texture.clone()));
    }

    fn notify_frame_ready(&self, texture: &SharedTextureHandle) {
        self.send(EncoderCommand::FrameReady(texture.clone()));
    }

    fn stop_session(&self) {
        self.active.store(false, Ordering::Release);
        self.send(EncoderCommand::Stop);
    }
}

impl Drop for EncoderWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EncoderThread<S> {
    sink: S,
    active: Arc<AtomicBool>,
    session: Option<EncoderSession>,
    texture: Option<SharedTextureHandle>,
    stats: EncoderStats,
}

fn run_encoder_thread<S: VideoSink>(
    sink: S,
    rx: Receiver<EncoderCommand>,
    active: Arc<AtomicBool>,
) {
    let mut state = EncoderThread {
        sink,
        active,
        session: None,
        texture: None,
        stats: EncoderStats::default(),
    };

    for command in rx.iter() {
        match command {
            EncoderCommand::Start { session, ack } => {
                let _ = ack.send(state.start(session));
            }
            EncoderCommand::UpdateContext(context) => state.update_context(context),
            EncoderCommand::SetTexture(texture) => {
                if state.texture.as_ref() != Some(&texture) {
                    tracing::debug!(texture = %texture, "encoder frame source changed");
                    state.texture = Some(texture);
                }
            }
            EncoderCommand::FrameReady(texture) => state.frame_ready(&texture),
            EncoderCommand::Stop => state.stop(),
            EncoderCommand::Stats(ack) => {
                let _ = ack.send(state.stats);
            }
            EncoderCommand::Shutdown => break,
        }
    }

    state.stop();
    tracing::debug!(?state.stats, "encoder thread exiting");
}

impl<S: VideoSink> EncoderThread<S> {
    fn start(&mut self, session: EncoderSession) -> Result<(), PipelineError> {
        if let Some(current) = self.session.as_ref() {
            tracing::warn!(
                output = %current.output.display(),
                "encoder already recording; ignoring start"
            );
            return Ok(());
        }
        self.sink
            .begin(&session)
            .map_err(|err| PipelineError::EncoderInitFailed(format!("{err:#}")))?;
        self.stats.sessions_started += 1;
        self.session = Some(session);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn update_context(&mut self, context: ContextRef) {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!(context = %context.id(), "no session to re-point; ignoring context update");
            return;
        };
        if let Err(err) = self.sink.update_context(&context) {
            tracing::error!(error = %format!("{err:#}"), "encoder failed to adopt shared context");
        }
        session.context = context;
        self.stats.context_updates += 1;
    }

    fn frame_ready(&mut self, texture: &SharedTextureHandle) {
        if self.session.is_none() || self.texture.is_none() {
            self.stats.frames_ignored += 1;
            return;
        }
        match self.sink.encode_frame(texture) {
            Ok(()) => self.stats.frames_encoded += 1,
            Err(err) => {
                self.stats.encode_errors += 1;
                tracing::warn!(texture = %texture, error = %format!("{err:#}"), "frame encode failed");
            }
        }
    }

    fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.active.store(false, Ordering::Release);
        self.stats.sessions_stopped += 1;
        match self.sink.finish() {
            Ok(()) => tracing::info!(output = %session.output.display(), "recording finished"),
            Err(err) => tracing::error!(
                output = %session.output.display(),
                error = %format!("{err:#}"),
                "failed to finalise recording"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSlot;
    use crate::types::{ContextId, TextureId};

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Begin(PreviewGeometry),
        Context(ContextId),
        Frame(TextureId),
        Finish,
    }

    #[derive(Clone, Default)]
    struct TestSink {
        events: Arc<Mutex<Vec<SinkEvent>>>,
        refuse: bool,
    }

    impl VideoSink for TestSink {
        fn begin(&mut self, session: &EncoderSession) -> anyhow::Result<()> {
            if self.refuse {
                anyhow::bail!("codec unavailable");
            }
            self.events.lock().push(SinkEvent::Begin(session.geometry));
            Ok(())
        }

        fn update_context(&mut self, context: &ContextRef) -> anyhow::Result<()> {
            self.events.lock().push(SinkEvent::Context(context.id()));
            Ok(())
        }

        fn encode_frame(&mut self, texture: &SharedTextureHandle) -> anyhow::Result<()> {
            self.events.lock().push(SinkEvent::Frame(texture.texture()));
            Ok(())
        }

        fn finish(&mut self) -> anyhow::Result<()> {
            self.events.lock().push(SinkEvent::Finish);
            Ok(())
        }
    }

    fn context() -> ContextRef {
        ContextRef::new(ContextId::next(), Arc::new(()))
    }

    fn session(context: &ContextRef) -> EncoderSession {
        EncoderSession {
            output: PathBuf::from(DEFAULT_OUTPUT),
            geometry: PreviewGeometry::new(1280, 720),
            bitrate: DEFAULT_BITRATE,
            context: context.clone(),
        }
    }

    fn texture(context: &ContextRef) -> SharedTextureHandle {
        SharedTextureHandle::new(TextureId(1), context.id(), FrameSlot::new())
    }

    #[test]
    fn frame_ready_without_session_is_ignored() {
        let sink = TestSink::default();
        let worker = EncoderWorker::spawn(sink.clone()).unwrap();
        let ctx = context();
        worker.notify_frame_ready(&texture(&ctx));

        let stats = worker.stats().unwrap();
        assert_eq!(stats.frames_ignored, 1);
        assert_eq!(stats.frames_encoded, 0);
        assert!(sink.events.lock().is_empty());
        assert!(!worker.is_session_active());
    }

    #[test]
    fn session_lifecycle_reaches_the_sink_in_order() {
        let sink = TestSink::default();
        let worker = EncoderWorker::spawn(sink.clone()).unwrap();
        let first = context();
        let handle = texture(&first);

        worker.start_session(session(&first)).unwrap();
        assert!(worker.is_session_active());
        worker.set_frame_source_identity(&handle);
        worker.notify_frame_ready(&handle);
        let second = context();
        worker.update_shared_context(second.clone());
        worker.stop_session();
        assert!(!worker.is_session_active());

        let stats = worker.stats().unwrap();
        assert_eq!(stats.sessions_started, 1);
        assert_eq!(stats.sessions_stopped, 1);
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.context_updates, 1);
        assert_eq!(
            sink.events.lock().as_slice(),
            &[
                SinkEvent::Begin(PreviewGeometry::new(1280, 720)),
                SinkEvent::Frame(TextureId(1)),
                SinkEvent::Context(second.id()),
                SinkEvent::Finish,
            ]
        );
    }

    #[test]
    fn sink_failure_is_reported_as_init_failure() {
        let sink = TestSink {
            refuse: true,
            ..TestSink::default()
        };
        let worker = EncoderWorker::spawn(sink).unwrap();
        let err = worker.start_session(session(&context())).unwrap_err();
        assert!(matches!(err, PipelineError::EncoderInitFailed(ref msg) if msg.contains("codec")));
        assert!(!worker.is_session_active());
    }

    #[test]
    fn second_start_is_ignored() {
        let sink = TestSink::default();
        let worker = EncoderWorker::spawn(sink.clone()).unwrap();
        let ctx = context();
        worker.start_session(session(&ctx)).unwrap();
        worker.start_session(session(&ctx)).unwrap();
        assert_eq!(worker.stats().unwrap().sessions_started, 1);
    }

    #[test]
    fn shutdown_finishes_open_session() {
        let sink = TestSink::default();
        let worker = EncoderWorker::spawn(sink.clone()).unwrap();
        worker.start_session(session(&context())).unwrap();
        worker.shutdown();
        assert_eq!(sink.events.lock().last(), Some(&SinkEvent::Finish));
        assert!(matches!(
            worker.stats(),
            Err(PipelineError::Disconnected("encoder"))
        ));
    }
}
