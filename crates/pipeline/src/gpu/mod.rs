//! GPU primitives the pipeline is built from.
//!
//! The renderer never talks to a graphics API directly; it drives a
//! [`GpuContext`], which owns one context's textures, programs, and display
//! surface:
//! - `soft` rasterises on the CPU and is what the tests and the synthetic
//!   demo run on.
//! - `hardware` (feature `hardware`) runs the same GLSL filter programs on a
//!   headless `wgpu` device that other contexts can share.
//!
//! Every fallible call returns a [`GpuError`]; callers treat any of them as
//! loss of the whole context.

#[cfg(feature = "hardware")]
pub mod hardware;
pub mod soft;

use crate::error::GpuError;
use crate::filter::{FilterVariant, Kernel};
use crate::types::{
    ContextRef, IndicatorRect, PreviewGeometry, ProgramId, SharedTextureHandle, SurfaceImage,
};

pub trait GpuContext {
    /// Share reference other contexts use to reach this context's objects.
    fn context_ref(&self) -> ContextRef;

    /// Creates the external texture the camera will stream into.
    fn create_external_texture(&mut self) -> Result<SharedTextureHandle, GpuError>;

    /// Latches the newest published frame into `texture`.
    ///
    /// Returns the frame's texture transform, or `None` when nothing arrived
    /// since the previous latch and the old contents stay in place.
    fn latch(&mut self, texture: &SharedTextureHandle) -> Result<Option<[f32; 16]>, GpuError>;

    fn compile_program(&mut self, variant: FilterVariant) -> Result<ProgramId, GpuError>;

    fn set_kernel(
        &mut self,
        program: ProgramId,
        kernel: &Kernel,
        color_bias: f32,
    ) -> Result<(), GpuError>;

    /// Pushes the incoming texture size, from which sampling offsets derive.
    fn set_texture_size(
        &mut self,
        program: ProgramId,
        geometry: PreviewGeometry,
    ) -> Result<(), GpuError>;

    fn draw_frame(
        &mut self,
        program: ProgramId,
        texture: &SharedTextureHandle,
        transform: &[f32; 16],
    ) -> Result<(), GpuError>;

    /// Fills `rect` with the recording colour on top of the last drawn frame.
    fn draw_indicator(&mut self, rect: IndicatorRect) -> Result<(), GpuError>;

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError>;

    /// Copies the display surface back, when the backend supports readback.
    fn read_surface(&mut self) -> Result<Option<SurfaceImage>, GpuError>;

    fn release_program(&mut self, program: ProgramId);

    fn release_texture(&mut self, texture: &SharedTextureHandle);
}

/// Offsets of the nine convolution taps for a texture of `geometry`, in texture units.
pub(crate) fn tap_offsets(geometry: PreviewGeometry) -> [[f32; 2]; 9] {
    let rw = 1.0 / geometry.width.max(1) as f32;
    let rh = 1.0 / geometry.height.max(1) as f32;
    [
        [-rw, -rh],
        [0.0, -rh],
        [rw, -rh],
        [-rw, 0.0],
        [0.0, 0.0],
        [rw, 0.0],
        [-rw, rh],
        [0.0, rh],
        [rw, rh],
    ]
}

/// Applies a column-major 4×4 texture transform to `(u, v)`.
pub(crate) fn transform_uv(transform: &[f32; 16], u: f32, v: f32) -> (f32, f32) {
    let x = transform[0] * u + transform[4] * v + transform[12];
    let y = transform[1] * u + transform[5] * v + transform[13];
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IDENTITY_TRANSFORM;

    #[test]
    fn tap_offsets_scale_with_texture_size() {
        let offsets = tap_offsets(PreviewGeometry::new(4, 2));
        assert_eq!(offsets[0], [-0.25, -0.5]);
        assert_eq!(offsets[4], [0.0, 0.0]);
        assert_eq!(offsets[8], [0.25, 0.5]);
    }

    #[test]
    fn identity_transform_keeps_coordinates() {
        assert_eq!(transform_uv(&IDENTITY_TRANSFORM, 0.3, 0.7), (0.3, 0.7));
    }

    #[test]
    fn vertical_flip_transform() {
        let mut flip = IDENTITY_TRANSFORM;
        flip[5] = -1.0;
        flip[13] = 1.0;
        let (u, v) = transform_uv(&flip, 0.25, 0.25);
        assert_eq!(u, 0.25);
        assert!((v - 0.75).abs() < 1e-6);
    }
}
