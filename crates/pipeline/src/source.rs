//! Frame-source adapter around the camera collaborator.
//!
//! Lives on the lifecycle-owner thread: it is the only code that opens,
//! starts, stops, or releases a camera device.

use std::fmt;

use crate::error::PipelineError;
use crate::frame::{FrameListener, FrameSlot};
use crate::types::{PreviewGeometry, SharedTextureHandle};

/// Preview size requested when the shell does not ask for one.
pub const DESIRED_PREVIEW: PreviewGeometry = PreviewGeometry::new(1280, 720);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    #[default]
    Front,
    Back,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => f.write_str("front"),
            Facing::Back => f.write_str("back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub index: usize,
    pub facing: Facing,
}

/// Preview frame-rate range in thousandths of a frame per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsRange {
    pub min_millis: u32,
    pub max_millis: u32,
}

impl FpsRange {
    pub const fn fixed(fps: u32) -> Self {
        Self {
            min_millis: fps * 1000,
            max_millis: fps * 1000,
        }
    }
}

pub trait CameraProvider {
    fn cameras(&self) -> Vec<CameraInfo>;

    /// Opens camera `index`, negotiating a preview size close to `desired`.
    fn open(
        &self,
        index: usize,
        desired: PreviewGeometry,
    ) -> Result<Box<dyn CameraDevice>, PipelineError>;
}

pub trait CameraDevice: Send {
    fn preview_geometry(&self) -> PreviewGeometry;

    fn fps_range(&self) -> FpsRange;

    /// Directs produced frames into `slot`.
    fn bind_target(&mut self, slot: FrameSlot) -> Result<(), PipelineError>;

    fn start_production(&mut self) -> Result<(), PipelineError>;

    /// Returns once no further frame will be written.
    fn stop_production(&mut self);

    fn release(&mut self);
}

/// Picks `desired` when the device supports it exactly, otherwise the device's preferred size.
pub fn choose_preview_size(
    supported: &[PreviewGeometry],
    desired: PreviewGeometry,
) -> Option<PreviewGeometry> {
    supported
        .iter()
        .copied()
        .find(|size| *size == desired)
        .or_else(|| {
            let preferred = supported.first().copied();
            if let Some(size) = preferred {
                tracing::warn!(%desired, fallback = %size, "desired preview size unavailable");
            }
            preferred
        })
}

/// Human-readable preview summary, e.g. `1280x720 @30fps`.
pub fn preview_facts(geometry: PreviewGeometry, fps: FpsRange) -> String {
    if fps.min_millis == fps.max_millis {
        format!("{geometry} @{}fps", format_fps(fps.min_millis))
    } else {
        format!(
            "{geometry} @[{} - {}] fps",
            format_fps(fps.min_millis),
            format_fps(fps.max_millis)
        )
    }
}

fn format_fps(millis: u32) -> String {
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        (f64::from(millis) / 1000.0).to_string()
    }
}

pub struct FrameSourceAdapter {
    device: Box<dyn CameraDevice>,
    info: CameraInfo,
    bound: Option<SharedTextureHandle>,
    producing: bool,
}

impl FrameSourceAdapter {
    /// Opens the first camera facing `preference`, or any camera if none does.
    pub fn open<P: CameraProvider + ?Sized>(
        provider: &P,
        preference: Facing,
        desired: PreviewGeometry,
    ) -> Result<Self, PipelineError> {
        let cameras = provider.cameras();
        let info = match cameras.iter().find(|camera| camera.facing == preference) {
            Some(info) => *info,
            None => {
                let fallback = cameras.first().copied().ok_or(PipelineError::NoCameraAvailable)?;
                tracing::info!(
                    wanted = %preference,
                    using = %fallback.facing,
                    "no camera with the preferred facing; opening default"
                );
                fallback
            }
        };

        let device = provider.open(info.index, desired)?;
        tracing::info!(
            camera = info.index,
            facing = %info.facing,
            preview = %preview_facts(device.preview_geometry(), device.fps_range()),
            "camera opened"
        );
        Ok(Self {
            device,
            info,
            bound: None,
            producing: false,
        })
    }

    pub fn info(&self) -> CameraInfo {
        self.info
    }

    pub fn geometry(&self) -> PreviewGeometry {
        self.device.preview_geometry()
    }

    pub fn facts(&self) -> String {
        preview_facts(self.device.preview_geometry(), self.device.fps_range())
    }

    /// Routes frames into `texture` and wakes the render context on each one.
    pub fn bind(
        &mut self,
        texture: SharedTextureHandle,
        listener: FrameListener,
    ) -> Result<(), PipelineError> {
        texture.slot().set_frame_listener(listener);
        self.device.bind_target(texture.slot().clone())?;
        tracing::debug!(texture = %texture, "camera bound to shared texture");
        self.bound = Some(texture);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.bound.is_none() {
            return Err(PipelineError::invariant(
                "camera production started before a shared texture was bound",
            ));
        }
        if !self.producing {
            self.device.start_production()?;
            self.producing = true;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.producing {
            self.device.stop_production();
            self.producing = false;
        }
    }

    /// Stops production and closes the device.
    pub fn release(mut self) {
        self.stop();
        if let Some(texture) = self.bound.take() {
            texture.slot().clear_frame_listener();
        }
        self.device.release();
        tracing::info!(camera = self.info.index, "camera released");
    }
}
