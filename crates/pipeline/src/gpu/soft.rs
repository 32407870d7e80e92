//! CPU implementation of [`GpuContext`].
//!
//! Sampling is nearest-neighbour with clamp-to-edge. Texture coordinate
//! `(0, 0)` is the first pixel of the frame buffer and surface rows run top to
//! bottom, so an identity transform reproduces the frame unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{tap_offsets, transform_uv, GpuContext};
use crate::error::GpuError;
use crate::filter::{FilterVariant, Kernel};
use crate::frame::{Frame, FrameSlot};
use crate::types::{
    ContextId, ContextRef, IndicatorRect, PreviewGeometry, ProgramId, SharedTextureHandle,
    SurfaceImage, TextureId,
};

const INDICATOR_RGBA: [u8; 4] = [255, 0, 0, 255];

/// Objects visible to every context created against the same share group.
#[derive(Debug, Default)]
pub struct SoftShareGroup {
    latched: Mutex<HashMap<TextureId, Frame>>,
}

impl SoftShareGroup {
    /// The frame most recently latched into `texture`.
    pub fn latched(&self, texture: TextureId) -> Option<Frame> {
        self.latched.lock().get(&texture).cloned()
    }
}

struct SoftTexture {
    slot: FrameSlot,
    frame: Option<Frame>,
}

struct SoftProgram {
    variant: FilterVariant,
    kernel: Kernel,
    color_bias: f32,
    offsets: [[f32; 2]; 9],
}

pub struct SoftContext {
    id: ContextId,
    share: Arc<SoftShareGroup>,
    textures: HashMap<TextureId, SoftTexture>,
    programs: HashMap<ProgramId, SoftProgram>,
    surface_size: Option<(u32, u32)>,
    surface: Option<SurfaceImage>,
    next_texture: u32,
    next_program: u32,
}

impl SoftContext {
    pub fn new() -> Self {
        Self::with_share_group(Arc::new(SoftShareGroup::default()))
    }

    /// Creates a context sharing objects with `other`, or a standalone one
    /// when `other` belongs to a different backend.
    pub fn shared_with(other: &ContextRef) -> Self {
        match other.share_group::<SoftShareGroup>() {
            Some(group) => Self::with_share_group(group),
            None => {
                tracing::warn!(
                    context = %other.id(),
                    "share reference is not a soft context; creating an unshared context"
                );
                Self::new()
            }
        }
    }

    fn with_share_group(share: Arc<SoftShareGroup>) -> Self {
        Self {
            id: ContextId::next(),
            share,
            textures: HashMap::new(),
            programs: HashMap::new(),
            surface_size: None,
            surface: None,
            next_texture: 1,
            next_program: 1,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn share_group(&self) -> &Arc<SoftShareGroup> {
        &self.share
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    fn program(&self, id: ProgramId) -> Result<&SoftProgram, GpuError> {
        self.programs
            .get(&id)
            .ok_or_else(|| GpuError::new("use_program", format!("unknown program {}", id.0)))
    }

    fn program_mut(&mut self, id: ProgramId) -> Result<&mut SoftProgram, GpuError> {
        self.programs
            .get_mut(&id)
            .ok_or_else(|| GpuError::new("use_program", format!("unknown program {}", id.0)))
    }

    fn texture(&self, handle: &SharedTextureHandle) -> Result<&SoftTexture, GpuError> {
        if handle.context() != self.id {
            return Err(GpuError::new(
                "bind_texture",
                format!("{handle} belongs to another context"),
            ));
        }
        self.textures.get(&handle.texture()).ok_or_else(|| {
            GpuError::new("bind_texture", format!("unknown texture {}", handle.texture().0))
        })
    }

    fn target_surface(&mut self, frame: Option<&Frame>) -> &mut SurfaceImage {
        let (width, height) = self
            .surface_size
            .or_else(|| frame.map(|f| (f.geometry.width, f.geometry.height)))
            .unwrap_or((1, 1));
        let stale = self
            .surface
            .as_ref()
            .map_or(true, |s| s.width != width || s.height != height);
        if stale {
            self.surface = Some(blank_surface(width, height));
        }
        self.surface.get_or_insert_with(|| blank_surface(width, height))
    }
}

impl Default for SoftContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuContext for SoftContext {
    fn context_ref(&self) -> ContextRef {
        ContextRef::new(self.id, self.share.clone())
    }

    fn create_external_texture(&mut self) -> Result<SharedTextureHandle, GpuError> {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        let slot = FrameSlot::new();
        self.textures.insert(
            id,
            SoftTexture {
                slot: slot.clone(),
                frame: None,
            },
        );
        Ok(SharedTextureHandle::new(id, self.id, slot))
    }

    fn latch(&mut self, texture: &SharedTextureHandle) -> Result<Option<[f32; 16]>, GpuError> {
        self.texture(texture)?;
        let Some(entry) = self.textures.get_mut(&texture.texture()) else {
            return Ok(None);
        };
        let Some(frame) = entry.slot.latch() else {
            return Ok(None);
        };
        let transform = frame.transform;
        self.share.latched.lock().insert(texture.texture(), frame.clone());
        entry.frame = Some(frame);
        Ok(Some(transform))
    }

    fn compile_program(&mut self, variant: FilterVariant) -> Result<ProgramId, GpuError> {
        let id = ProgramId(self.next_program);
        self.next_program += 1;
        self.programs.insert(
            id,
            SoftProgram {
                variant,
                kernel: [0.0; 9],
                color_bias: 0.0,
                offsets: [[0.0; 2]; 9],
            },
        );
        Ok(id)
    }

    fn set_kernel(
        &mut self,
        program: ProgramId,
        kernel: &Kernel,
        color_bias: f32,
    ) -> Result<(), GpuError> {
        let program = self.program_mut(program)?;
        program.kernel = *kernel;
        program.color_bias = color_bias;
        Ok(())
    }

    fn set_texture_size(
        &mut self,
        program: ProgramId,
        geometry: PreviewGeometry,
    ) -> Result<(), GpuError> {
        self.program_mut(program)?.offsets = tap_offsets(geometry);
        Ok(())
    }

    fn draw_frame(
        &mut self,
        program: ProgramId,
        texture: &SharedTextureHandle,
        transform: &[f32; 16],
    ) -> Result<(), GpuError> {
        let frame = self.texture(texture)?.frame.clone();
        let (variant, kernel, color_bias, offsets) = {
            let p = self.program(program)?;
            (p.variant, p.kernel, p.color_bias, p.offsets)
        };

        let surface = self.target_surface(frame.as_ref());
        let Some(frame) = frame else {
            surface.rgba.fill(0);
            return Ok(());
        };

        let (width, height) = (surface.width, surface.height);
        for y in 0..height {
            for x in 0..width {
                let u = (x as f32 + 0.5) / width as f32;
                let v = (y as f32 + 0.5) / height as f32;
                let (u, v) = transform_uv(transform, u, v);
                let color = match variant {
                    FilterVariant::Passthrough => sample(&frame, u, v),
                    FilterVariant::Grayscale => {
                        let c = sample(&frame, u, v);
                        let l = c[0] * 0.3 + c[1] * 0.59 + c[2] * 0.11;
                        [l, l, l, 1.0]
                    }
                    FilterVariant::Convolve => {
                        let mut sum = [0.0f32; 3];
                        for (tap, weight) in offsets.iter().zip(kernel.iter()) {
                            let c = sample(&frame, u + tap[0], v + tap[1]);
                            for channel in 0..3 {
                                sum[channel] += c[channel] * weight;
                            }
                        }
                        [
                            sum[0] + color_bias,
                            sum[1] + color_bias,
                            sum[2] + color_bias,
                            1.0,
                        ]
                    }
                };
                let offset = (y as usize * width as usize + x as usize) * 4;
                for (channel, value) in color.iter().enumerate() {
                    surface.rgba[offset + channel] = to_unorm(*value);
                }
            }
        }
        Ok(())
    }

    fn draw_indicator(&mut self, rect: IndicatorRect) -> Result<(), GpuError> {
        let Some(surface) = self.surface.as_mut() else {
            return Ok(());
        };
        let x_end = rect.x.saturating_add(rect.width).min(surface.width);
        let y_end = rect.y.saturating_add(rect.height).min(surface.height);
        for gl_y in rect.y.min(y_end)..y_end {
            let row = surface.height - 1 - gl_y;
            for x in rect.x.min(x_end)..x_end {
                let offset = (row as usize * surface.width as usize + x as usize) * 4;
                surface.rgba[offset..offset + 4].copy_from_slice(&INDICATOR_RGBA);
            }
        }
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::new(
                "resize_surface",
                format!("invalid surface size {width}x{height}"),
            ));
        }
        self.surface_size = Some((width, height));
        self.surface = Some(blank_surface(width, height));
        Ok(())
    }

    fn read_surface(&mut self) -> Result<Option<SurfaceImage>, GpuError> {
        Ok(self.surface.clone())
    }

    fn release_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn release_texture(&mut self, texture: &SharedTextureHandle) {
        if let Some(entry) = self.textures.remove(&texture.texture()) {
            entry.slot.release();
        }
        self.share.latched.lock().remove(&texture.texture());
    }
}

fn blank_surface(width: u32, height: u32) -> SurfaceImage {
    SurfaceImage {
        width,
        height,
        rgba: vec![0; width as usize * height as usize * 4],
    }
}

fn sample(frame: &Frame, u: f32, v: f32) -> [f32; 4] {
    let width = frame.geometry.width.max(1);
    let height = frame.geometry.height.max(1);
    let x = ((u * width as f32).floor() as i64).clamp(0, width as i64 - 1) as usize;
    let y = ((v * height as f32).floor() as i64).clamp(0, height as i64 - 1) as usize;
    let offset = (y * width as usize + x) * 4;
    match frame.pixels.get(offset..offset + 4) {
        Some(px) => [
            px[0] as f32 / 255.0,
            px[1] as f32 / 255.0,
            px[2] as f32 / 255.0,
            px[3] as f32 / 255.0,
        ],
        None => [0.0, 0.0, 0.0, 1.0],
    }
}

fn to_unorm(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
