//! On-screen draw loop of the render context.
//!
//! ```text
//!   Uninitialized ──on_context_created──▶ Active ──pause──▶ Paused
//!                                           ▲                  │
//!                                           └─on_context_created┘
//! ```
//!
//! Setters (`set_preview_geometry`, `set_recording_requested`, `set_filter`)
//! only record intent; everything they imply happens in the next [`tick`].
//! A [`GpuError`] from any call drops the context without cleanup and leaves
//! the renderer `Paused`.
//!
//! [`tick`]: FrameRenderer::tick

use std::sync::Arc;

use crate::encoder::{EncoderCollaborator, SessionTemplate};
use crate::error::{GpuError, PipelineError};
use crate::filter::{ActiveProgram, FilterId, FilterProgramSelector};
use crate::gpu::GpuContext;
use crate::recording::{RecordingAction, RecordingSessionController, RecordingState};
use crate::registry::SurfacePublisher;
use crate::types::{
    IndicatorRect, PreviewGeometry, SharedTextureHandle, SurfaceImage, IDENTITY_TRANSFORM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererPhase {
    Uninitialized,
    Active,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RendererOptions {
    pub session: SessionTemplate,
    pub indicator: IndicatorRect,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// No context; nothing ran.
    pub skipped: bool,
    pub latched: bool,
    pub recompiled: bool,
    pub drew: bool,
    pub indicator: bool,
    pub recording: RecordingAction,
    /// Recording start failure; the request has been cleared.
    pub recording_error: Option<PipelineError>,
}

struct ActiveContext<G> {
    gpu: G,
    texture: SharedTextureHandle,
    program: ActiveProgram,
    transform: [f32; 16],
}

enum Phase<G> {
    Uninitialized,
    Active(ActiveContext<G>),
    Paused,
}

pub struct FrameRenderer<G: GpuContext> {
    phase: Phase<G>,
    encoder: Arc<dyn EncoderCollaborator>,
    publisher: SurfacePublisher,
    options: RendererOptions,
    recording: RecordingSessionController,
    recording_requested: bool,
    geometry: Option<PreviewGeometry>,
    geometry_dirty: bool,
    filter: FilterProgramSelector,
    indicator_count: u32,
}

impl<G: GpuContext> FrameRenderer<G> {
    pub fn new(
        encoder: Arc<dyn EncoderCollaborator>,
        publisher: SurfacePublisher,
        options: RendererOptions,
    ) -> Self {
        Self {
            phase: Phase::Uninitialized,
            encoder,
            publisher,
            options,
            recording: RecordingSessionController::new(),
            recording_requested: false,
            geometry: None,
            geometry_dirty: false,
            filter: FilterProgramSelector::new(),
            indicator_count: 0,
        }
    }

    pub fn phase(&self) -> RendererPhase {
        match self.phase {
            Phase::Uninitialized => RendererPhase::Uninitialized,
            Phase::Active(_) => RendererPhase::Active,
            Phase::Paused => RendererPhase::Paused,
        }
    }

    pub fn recording_state(&self) -> Option<RecordingState> {
        self.recording.state()
    }

    pub fn recording_requested(&self) -> bool {
        self.recording_requested
    }

    pub fn geometry(&self) -> Option<PreviewGeometry> {
        self.geometry
    }

    pub fn requested_filter(&self) -> FilterId {
        self.filter.requested()
    }

    pub fn active_filter(&self) -> Option<FilterId> {
        self.filter.current()
    }

    pub fn shared_texture(&self) -> Option<&SharedTextureHandle> {
        match &self.phase {
            Phase::Active(active) => Some(&active.texture),
            _ => None,
        }
    }

    pub fn gpu(&self) -> Option<&G> {
        match &self.phase {
            Phase::Active(active) => Some(&active.gpu),
            _ => None,
        }
    }

    /// Adopts a freshly created GPU context and publishes its shared texture.
    pub fn on_context_created(
        &mut self,
        mut gpu: G,
    ) -> Result<SharedTextureHandle, PipelineError> {
        if matches!(self.phase, Phase::Active(_)) {
            tracing::warn!("render context recreated without a pause; abandoning previous resources");
            self.phase = Phase::Paused;
        }

        // A session that outlived the previous context keeps recording.
        self.recording_requested = self.encoder.is_session_active();
        let state = self.recording.on_context_created(self.recording_requested);

        let program = FilterProgramSelector::compile_default(&mut gpu)
            .map_err(|err| self.context_lost(err))?;
        let texture = gpu
            .create_external_texture()
            .map_err(|err| self.context_lost(err))?;

        self.filter.reset();
        self.geometry_dirty = self.geometry.is_some();
        self.phase = Phase::Active(ActiveContext {
            gpu,
            texture: texture.clone(),
            program,
            transform: IDENTITY_TRANSFORM,
        });

        let epoch = self.publisher.publish(texture.clone())?;
        tracing::info!(
            texture = %texture,
            epoch,
            recording = %state,
            "render context created"
        );
        Ok(texture)
    }

    pub fn surface_changed(&mut self, width: u32, height: u32) -> Result<(), PipelineError> {
        tracing::info!(width, height, "display surface changed");
        let Phase::Active(active) = &mut self.phase else {
            tracing::warn!(width, height, "surface change without a render context; ignoring");
            return Ok(());
        };
        if let Err(err) = active.gpu.resize_surface(width, height) {
            return Err(self.context_lost(err));
        }
        Ok(())
    }

    /// Releases the shared texture and program and forgets the geometry.
    pub fn pause(&mut self) {
        if let Phase::Active(mut active) = std::mem::replace(&mut self.phase, Phase::Paused) {
            active.gpu.release_texture(&active.texture);
            active.gpu.release_program(active.program.id);
            tracing::info!(texture = %active.texture, "render context paused");
        } else {
            tracing::debug!("pause without an active render context");
        }
        self.geometry = None;
        self.geometry_dirty = false;
        self.recording.on_context_lost();
    }

    pub fn set_preview_geometry(&mut self, geometry: PreviewGeometry) {
        if !geometry.is_known() {
            tracing::warn!(%geometry, "ignoring degenerate preview geometry");
            return;
        }
        tracing::debug!(%geometry, "preview geometry updated");
        self.geometry = Some(geometry);
        self.geometry_dirty = true;
    }

    pub fn set_recording_requested(&mut self, requested: bool) {
        tracing::info!(was = self.recording_requested, now = requested, "recording request changed");
        self.recording_requested = requested;
    }

    pub fn set_filter(&mut self, filter: FilterId) {
        tracing::debug!(%filter, "filter requested");
        self.filter.request(filter);
    }

    /// Runs one frame of the draw loop.
    pub fn tick(&mut self) -> Result<TickReport, PipelineError> {
        let result = self.run_tick();
        if let Err(PipelineError::ContextLossUnrecoverable(err)) = &result {
            self.enter_lost(err);
        }
        result
    }

    /// Copy of the display surface, when the backend can read it back.
    pub fn snapshot(&mut self) -> Result<Option<SurfaceImage>, PipelineError> {
        let Phase::Active(active) = &mut self.phase else {
            return Ok(None);
        };
        match active.gpu.read_surface() {
            Ok(image) => Ok(image),
            Err(err) => Err(self.context_lost(err)),
        }
    }

    fn run_tick(&mut self) -> Result<TickReport, PipelineError> {
        let Self {
            phase,
            encoder,
            options,
            recording,
            recording_requested,
            geometry,
            geometry_dirty,
            filter,
            indicator_count,
            ..
        } = self;

        let Phase::Active(active) = phase else {
            tracing::trace!("tick without a render context; skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };
        let mut report = TickReport::default();

        if let Some(transform) = active.gpu.latch(&active.texture)? {
            active.transform = transform;
            report.latched = true;
        }

        let context = active.gpu.context_ref();
        match recording.step(
            *recording_requested,
            &**encoder,
            &options.session,
            *geometry,
            &context,
        ) {
            Ok(action) => report.recording = action,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::error!(error = %err, "recording failed to start; clearing the request");
                *recording_requested = false;
                report.recording_error = Some(err);
            }
        }

        encoder.set_frame_source_identity(&active.texture);
        encoder.notify_frame_ready(&active.texture);

        let Some(geometry) = *geometry else {
            tracing::trace!("preview geometry unknown; frame not drawn");
            return Ok(report);
        };

        if filter.is_pending() && filter.apply(&mut active.gpu, &mut active.program)? {
            report.recompiled = true;
            *geometry_dirty = true;
        }
        if *geometry_dirty {
            active.gpu.set_texture_size(active.program.id, geometry)?;
            *geometry_dirty = false;
        }

        active
            .gpu
            .draw_frame(active.program.id, &active.texture, &active.transform)?;
        report.drew = true;

        if recording.state() == Some(RecordingState::On) {
            let shown = (*indicator_count & 0x4) == 0;
            *indicator_count = indicator_count.wrapping_add(1);
            if shown {
                active.gpu.draw_indicator(options.indicator)?;
                report.indicator = true;
            }
        }

        Ok(report)
    }

    fn context_lost(&mut self, err: GpuError) -> PipelineError {
        self.enter_lost(&err);
        PipelineError::ContextLossUnrecoverable(err)
    }

    fn enter_lost(&mut self, err: &GpuError) {
        tracing::error!(error = %err, "GPU context lost; dropping its resources without cleanup");
        self.phase = Phase::Paused;
        self.geometry = None;
        self.geometry_dirty = false;
        self.recording.on_context_lost();
    }
}
