//! Render execution context.
//!
//! [`RenderThread`] owns a [`FrameRenderer`] on a dedicated thread. Every
//! lifecycle notification and user intent is a message on one channel, so
//! ticks never overlap with each other or with a lifecycle change. Frame
//! availability goes through a [`RenderRequester`], which keeps at most one
//! render request in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::encoder::EncoderCollaborator;
use crate::error::{GpuError, PipelineError};
use crate::filter::FilterId;
use crate::frame::FrameListener;
use crate::gpu::GpuContext;
use crate::recording::RecordingState;
use crate::registry::SurfacePublisher;
use crate::renderer::{FrameRenderer, RendererOptions, RendererPhase, TickReport};
use crate::types::{PreviewGeometry, SurfaceImage};

enum RenderCommand {
    AcquireContext(Sender<Result<(), PipelineError>>),
    SurfaceChanged { width: u32, height: u32 },
    PreviewGeometry(PreviewGeometry),
    Recording(bool),
    Filter(FilterId),
    Pause(Sender<()>),
    Snapshot(Sender<Result<Option<SurfaceImage>, PipelineError>>),
    Status(Sender<RenderStatus>),
    Render,
    Shutdown,
}

/// Conditions the render thread reports back to the lifecycle owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    /// Recording could not start; the request was cleared.
    RecordingFailed(PipelineError),
    /// The GPU context died mid-tick; the renderer is paused.
    ContextLost(PipelineError),
    /// A command failed without touching the context; rendering continues.
    Failed(PipelineError),
    /// A bug-class error; the render thread has stopped.
    Fatal(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStatus {
    pub phase: RendererPhase,
    pub recording: Option<RecordingState>,
    pub recording_requested: bool,
    pub filter: Option<FilterId>,
    pub ticks: u64,
    pub frames_drawn: u64,
    pub indicators_drawn: u64,
    pub recompiles: u64,
}

/// Frame-available handler. Cheap to clone; safe to call from any thread.
#[derive(Clone)]
pub struct RenderRequester {
    pending: Arc<AtomicBool>,
    tx: Sender<RenderCommand>,
}

impl RenderRequester {
    /// Asks for one more tick. A no-op while a request is still queued.
    pub fn request_render(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.tx.send(RenderCommand::Render).is_err() {
            self.pending.store(false, Ordering::Release);
        }
    }

    /// Wraps the requester as a frame listener for a [`FrameSlot`](crate::frame::FrameSlot).
    pub fn listener(&self) -> FrameListener {
        let requester = self.clone();
        Arc::new(move || requester.request_render())
    }
}

pub struct RenderThread {
    tx: Sender<RenderCommand>,
    requester: RenderRequester,
    events: Receiver<RenderEvent>,
    join_handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Starts the render thread. `factory` runs on that thread for every
    /// context acquisition, so `G` itself never crosses threads.
    pub fn spawn<G, F>(
        factory: F,
        encoder: Arc<dyn EncoderCollaborator>,
        publisher: SurfacePublisher,
        options: RendererOptions,
    ) -> Result<Self, PipelineError>
    where
        G: GpuContext + 'static,
        F: FnMut() -> Result<G, GpuError> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let pending = Arc::new(AtomicBool::new(false));
        let loop_pending = pending.clone();

        let handle = thread::Builder::new()
            .name("dualcam-render".into())
            .spawn(move || {
                let renderer = FrameRenderer::<G>::new(encoder, publisher, options);
                run_render_thread(factory, renderer, rx, loop_pending, event_tx);
            })
            .map_err(|err| PipelineError::ThreadSpawn {
                name: "render",
                reason: err.to_string(),
            })?;

        Ok(Self {
            requester: RenderRequester {
                pending,
                tx: tx.clone(),
            },
            tx,
            events: event_rx,
            join_handle: Some(handle),
        })
    }

    pub fn requester(&self) -> RenderRequester {
        self.requester.clone()
    }

    /// Creates the render context and waits until its texture is published.
    pub fn acquire_context(&self) -> Result<(), PipelineError> {
        self.round_trip(RenderCommand::AcquireContext)?
    }

    pub fn surface_changed(&self, width: u32, height: u32) -> Result<(), PipelineError> {
        self.send(RenderCommand::SurfaceChanged { width, height })
    }

    pub fn set_preview_geometry(&self, geometry: PreviewGeometry) -> Result<(), PipelineError> {
        self.send(RenderCommand::PreviewGeometry(geometry))
    }

    pub fn set_recording(&self, requested: bool) -> Result<(), PipelineError> {
        self.send(RenderCommand::Recording(requested))
    }

    /// Validates a raw filter id and forwards it.
    pub fn set_filter(&self, filter_id: u32) -> Result<(), PipelineError> {
        let filter = FilterId::try_from(filter_id)?;
        self.send(RenderCommand::Filter(filter))
    }

    /// Releases the render context's GPU resources; returns once they are gone.
    pub fn pause(&self) -> Result<(), PipelineError> {
        self.round_trip(RenderCommand::Pause)
    }

    pub fn snapshot(&self) -> Result<Option<SurfaceImage>, PipelineError> {
        self.round_trip(RenderCommand::Snapshot)?
    }

    /// State after every command sent before this call has been handled.
    pub fn status(&self) -> Result<RenderStatus, PipelineError> {
        self.round_trip(RenderCommand::Status)
    }

    pub fn take_events(&self) -> Vec<RenderEvent> {
        self.events.try_iter().collect()
    }

    /// Pauses the renderer and joins the thread.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.stop()
    }

    pub(crate) fn stop(&mut self) -> Result<(), PipelineError> {
        if let Some(handle) = self.join_handle.take() {
            let _ = self.tx.send(RenderCommand::Shutdown);
            handle.join().map_err(|_| PipelineError::ThreadSpawn {
                name: "render",
                reason: "render thread panicked".into(),
            })?;
        }
        Ok(())
    }

    fn send(&self, command: RenderCommand) -> Result<(), PipelineError> {
        self.tx
            .send(command)
            .map_err(|_| PipelineError::Disconnected("render"))
    }

    fn round_trip<T>(
        &self,
        command: impl FnOnce(Sender<T>) -> RenderCommand,
    ) -> Result<T, PipelineError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.send(command(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| PipelineError::Disconnected("render"))
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "render thread did not stop cleanly");
        }
    }
}

struct LoopCounters {
    ticks: u64,
    frames_drawn: u64,
    indicators_drawn: u64,
    recompiles: u64,
}

impl LoopCounters {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.frames_drawn += u64::from(report.drew);
        self.indicators_drawn += u64::from(report.indicator);
        self.recompiles += u64::from(report.recompiled);
    }
}

fn run_render_thread<G, F>(
    mut factory: F,
    mut renderer: FrameRenderer<G>,
    rx: Receiver<RenderCommand>,
    pending: Arc<AtomicBool>,
    events: Sender<RenderEvent>,
) where
    G: GpuContext,
    F: FnMut() -> Result<G, GpuError>,
{
    let mut counters = LoopCounters {
        ticks: 0,
        frames_drawn: 0,
        indicators_drawn: 0,
        recompiles: 0,
    };

    for command in rx.iter() {
        match command {
            RenderCommand::AcquireContext(ack) => {
                let result = factory()
                    .map_err(PipelineError::from)
                    .and_then(|gpu| renderer.on_context_created(gpu))
                    .map(|_| ());
                let fatal = result.as_ref().err().filter(|err| err.is_fatal()).cloned();
                if let Some(err) = &fatal {
                    tracing::error!(error = %err, "render thread stopping");
                    let _ = events.send(RenderEvent::Fatal(err.clone()));
                }
                let _ = ack.send(result);
                if fatal.is_some() {
                    break;
                }
            }
            RenderCommand::SurfaceChanged { width, height } => {
                if let Err(err) = renderer.surface_changed(width, height) {
                    if report_error(&events, err) {
                        break;
                    }
                }
            }
            RenderCommand::PreviewGeometry(geometry) => renderer.set_preview_geometry(geometry),
            RenderCommand::Recording(requested) => renderer.set_recording_requested(requested),
            RenderCommand::Filter(filter) => renderer.set_filter(filter),
            RenderCommand::Pause(ack) => {
                renderer.pause();
                let _ = ack.send(());
            }
            RenderCommand::Snapshot(ack) => {
                let result = renderer.snapshot();
                let stop = match &result {
                    Err(err) => report_error(&events, err.clone()),
                    Ok(_) => false,
                };
                let _ = ack.send(result);
                if stop {
                    break;
                }
            }
            RenderCommand::Status(ack) => {
                let _ = ack.send(RenderStatus {
                    phase: renderer.phase(),
                    recording: renderer.recording_state(),
                    recording_requested: renderer.recording_requested(),
                    filter: renderer.active_filter(),
                    ticks: counters.ticks,
                    frames_drawn: counters.frames_drawn,
                    indicators_drawn: counters.indicators_drawn,
                    recompiles: counters.recompiles,
                });
            }
            RenderCommand::Render => {
                // Cleared before the tick so a frame arriving mid-tick queues one more.
                pending.store(false, Ordering::Release);
                match renderer.tick() {
                    Ok(report) => {
                        counters.record(&report);
                        if let Some(err) = report.recording_error {
                            let _ = events.send(RenderEvent::RecordingFailed(err));
                        }
                    }
                    Err(err) => {
                        if report_error(&events, err) {
                            break;
                        }
                    }
                }
            }
            RenderCommand::Shutdown => break,
        }
    }

    renderer.pause();
    tracing::debug!(ticks = counters.ticks, "render thread exiting");
}

impl RenderEvent {
    /// Context loss only for GPU failures; bug-class errors are fatal.
    fn from_error(err: PipelineError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err)
        } else if matches!(err, PipelineError::ContextLossUnrecoverable(_)) {
            Self::ContextLost(err)
        } else {
            Self::Failed(err)
        }
    }
}

/// Forwards `err` to the owner. Returns true when the thread must stop.
fn report_error(events: &Sender<RenderEvent>, err: PipelineError) -> bool {
    let event = RenderEvent::from_error(err);
    let fatal = matches!(event, RenderEvent::Fatal(_));
    if let RenderEvent::Fatal(err) = &event {
        tracing::error!(error = %err, "render thread stopping");
    }
    let _ = events.send(event);
    fatal
}
