//! Frame distribution and filter pipeline for a dual-output camera preview.
//!
//! Camera frames are drawn to a display surface through a selectable filter
//! while, optionally, the same frames feed a video encoder. Three execution
//! contexts cooperate only through messages:
//!
//! ```text
//!   LifecycleOwner (shell thread)
//!      │ open/bind/start camera            ┌──────────────────────────────┐
//!      │ acquire / pause / intents ──────▶ │ RenderThread ─▶ FrameRenderer │
//!      │                                   │   latch ─▶ recording step     │
//!      │ ◀── SharedSurfaceRegistry ─────── │   ─▶ encoder notify ─▶ filter │
//!      │     (one texture per context)     │   ─▶ draw ─▶ indicator        │
//!      ▼                                   └──────────────┬───────────────┘
//!   FrameSourceAdapter ── FrameSlot ─▶ frame-available ───┘
//!                                                         │ EncoderCollaborator
//!                                                         ▼
//!                                              EncoderWorker ─▶ VideoSink
//! ```
//!
//! The GPU is abstracted behind [`gpu::GpuContext`]: [`gpu::soft`] renders on
//! the CPU, `gpu::hardware` (feature `hardware`) runs the GLSL filters on a
//! headless `wgpu` device.

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
mod compile;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod frame;
pub mod gpu;
pub mod lifecycle;
pub mod recording;
pub mod registry;
pub mod render_loop;
pub mod renderer;
pub mod source;
pub mod synthetic;
pub mod types;

pub use encoder::{
    EncoderCollaborator, EncoderSession, EncoderStats, EncoderWorker, SessionTemplate, VideoSink,
};
pub use error::{GpuError, PipelineError};
pub use filter::{select, FilterId, FilterProgramSelector, FilterSpec, FilterVariant};
pub use frame::{Frame, FrameSlot};
pub use gpu::GpuContext;
pub use lifecycle::{LifecycleOptions, LifecycleOwner};
pub use recording::{RecordingAction, RecordingSessionController, RecordingState};
pub use registry::{shared_surface_registry, SurfacePublisher, SurfaceSubscriber};
pub use render_loop::{RenderEvent, RenderRequester, RenderStatus, RenderThread};
pub use renderer::{FrameRenderer, RendererOptions, RendererPhase, TickReport};
pub use source::{CameraDevice, CameraProvider, Facing, FrameSourceAdapter};
pub use types::{ContextRef, IndicatorRect, PreviewGeometry, SharedTextureHandle, SurfaceImage};
