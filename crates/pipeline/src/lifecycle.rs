//! Lifecycle-owner context: the shell-facing entry point.
//!
//! ```text
//!   resume:  open camera ─▶ acquire render context ─▶ surface/geometry
//!            ─▶ consume published texture ─▶ bind ─▶ start production
//!   pause:   stop + release camera ─▶ render pause (blocking)
//! ```
//!
//! The encoder is passed in rather than owned, so a recording survives the
//! owner being dropped and rebuilt around the same encoder.

use std::sync::Arc;

use crate::encoder::EncoderCollaborator;
use crate::error::{GpuError, PipelineError};
use crate::gpu::GpuContext;
use crate::registry::{shared_surface_registry, SurfaceSubscriber};
use crate::render_loop::{RenderEvent, RenderStatus, RenderThread};
use crate::renderer::RendererOptions;
use crate::source::{CameraProvider, Facing, FrameSourceAdapter, DESIRED_PREVIEW};
use crate::types::{PreviewGeometry, SurfaceImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleOptions {
    pub facing: Facing,
    pub desired_preview: PreviewGeometry,
    /// Display surface size; the preview size when unset.
    pub surface: Option<PreviewGeometry>,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            facing: Facing::Front,
            desired_preview: DESIRED_PREVIEW,
            surface: None,
        }
    }
}

pub struct LifecycleOwner<P: CameraProvider> {
    provider: P,
    options: LifecycleOptions,
    encoder: Arc<dyn EncoderCollaborator>,
    render: RenderThread,
    subscriber: SurfaceSubscriber,
    camera: Option<FrameSourceAdapter>,
    recording: bool,
}

impl<P: CameraProvider> LifecycleOwner<P> {
    pub fn new<G, F>(
        provider: P,
        factory: F,
        encoder: Arc<dyn EncoderCollaborator>,
        renderer: RendererOptions,
        options: LifecycleOptions,
    ) -> Result<Self, PipelineError>
    where
        G: GpuContext + 'static,
        F: FnMut() -> Result<G, GpuError> + Send + 'static,
    {
        let (publisher, subscriber) = shared_surface_registry();
        let render = RenderThread::spawn(factory, encoder.clone(), publisher, renderer)?;
        let recording = encoder.is_session_active();
        Ok(Self {
            provider,
            options,
            encoder,
            render,
            subscriber,
            camera: None,
            recording,
        })
    }

    pub fn is_resumed(&self) -> bool {
        self.camera.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Negotiated preview summary of the open camera.
    pub fn camera_facts(&self) -> Option<String> {
        self.camera.as_ref().map(FrameSourceAdapter::facts)
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        if self.camera.is_some() {
            tracing::warn!("resume while already resumed; ignoring");
            return Ok(());
        }

        let mut camera = FrameSourceAdapter::open(
            &self.provider,
            self.options.facing,
            self.options.desired_preview,
        )?;
        if let Err(err) = self.attach(&mut camera) {
            camera.release();
            self.detach_render_context();
            return Err(err);
        }

        tracing::info!(facts = %camera.facts(), "preview running");
        self.camera = Some(camera);
        Ok(())
    }

    fn attach(&mut self, camera: &mut FrameSourceAdapter) -> Result<(), PipelineError> {
        let geometry = camera.geometry();
        self.render.acquire_context()?;
        let surface = self.options.surface.unwrap_or(geometry);
        self.render.surface_changed(surface.width, surface.height)?;
        self.render.set_preview_geometry(geometry)?;

        let published = self.subscriber.consume()?;
        tracing::debug!(
            texture = %published.handle,
            epoch = published.epoch,
            "binding camera to render context"
        );
        camera.bind(published.handle, self.render.requester().listener())?;
        camera.start()
    }

    /// Undoes a partial attach so the next resume starts from a paused context.
    fn detach_render_context(&mut self) {
        if let Err(err) = self.render.pause() {
            tracing::warn!(
                error = %err,
                "could not pause the render context after a failed resume"
            );
        }
        match self.subscriber.try_consume() {
            Ok(Some(stale)) => {
                tracing::debug!(
                    texture = %stale.handle,
                    epoch = stale.epoch,
                    "discarding unbound texture publish"
                );
            }
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "no render context to drain"),
        }
    }

    /// Stops the camera, then releases the render context's resources.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        if let Some(camera) = self.camera.take() {
            camera.release();
        }
        self.render.pause()?;
        tracing::info!("paused");
        Ok(())
    }

    pub fn set_recording(&mut self, requested: bool) -> Result<(), PipelineError> {
        self.recording = requested;
        self.render.set_recording(requested)
    }

    /// Flips the recording intent and returns the new value.
    pub fn toggle_recording(&mut self) -> Result<bool, PipelineError> {
        let requested = !self.recording;
        self.set_recording(requested)?;
        Ok(requested)
    }

    pub fn set_filter(&self, filter_id: u32) -> Result<(), PipelineError> {
        self.render.set_filter(filter_id)
    }

    pub fn status(&self) -> Result<RenderStatus, PipelineError> {
        self.render.status()
    }

    pub fn snapshot(&self) -> Result<Option<SurfaceImage>, PipelineError> {
        self.render.snapshot()
    }

    /// Drains render-thread events; a failed recording start also clears the intent.
    pub fn take_events(&mut self) -> Vec<RenderEvent> {
        let events = self.render.take_events();
        if events
            .iter()
            .any(|event| matches!(event, RenderEvent::RecordingFailed(_)))
        {
            self.recording = self.encoder.is_session_active();
        }
        events
    }

    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        if let Some(camera) = self.camera.take() {
            camera.release();
        }
        self.render.stop()
    }
}

impl<P: CameraProvider> Drop for LifecycleOwner<P> {
    fn drop(&mut self) {
        if let Some(camera) = self.camera.take() {
            camera.release();
        }
    }
}
