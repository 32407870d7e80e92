use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::FrameSlot;

/// Column-major 4×4 identity, the transform of a frame that needs no correction.
pub const IDENTITY_TRANSFORM: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Width/height of the frames the camera produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewGeometry {
    pub width: u32,
    pub height: u32,
}

impl PreviewGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A geometry with a zero side is treated as "not known yet".
    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for PreviewGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Process-unique identity of a GPU context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Reference another context can use to share GPU objects with the owner.
///
/// The share group is backend specific and only ever read through
/// [`ContextRef::share_group`]; holding a `ContextRef` never keeps the owning
/// context alive.
#[derive(Clone)]
pub struct ContextRef {
    id: ContextId,
    share: Arc<dyn Any + Send + Sync>,
}

impl ContextRef {
    pub fn new(id: ContextId, share: Arc<dyn Any + Send + Sync>) -> Self {
        Self { id, share }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn share_group<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.share.clone().downcast::<T>().ok()
    }
}

impl PartialEq for ContextRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContextRef {}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// External texture created by the render context and fed by the camera.
///
/// The frame source writes into [`SharedTextureHandle::slot`]; only the
/// creating context latches or destroys it.
#[derive(Clone)]
pub struct SharedTextureHandle {
    texture: TextureId,
    context: ContextId,
    slot: FrameSlot,
}

impl SharedTextureHandle {
    pub fn new(texture: TextureId, context: ContextId, slot: FrameSlot) -> Self {
        Self {
            texture,
            context,
            slot,
        }
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }
}

impl PartialEq for SharedTextureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.texture == other.texture && self.context == other.context
    }
}

impl Eq for SharedTextureHandle {}

impl fmt::Debug for SharedTextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTextureHandle")
            .field("texture", &self.texture.0)
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for SharedTextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex{}@{}", self.texture.0, self.context)
    }
}

/// Region of the display surface in GL window coordinates (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl IndicatorRect {
    pub const fn square(size: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size,
            height: size,
        }
    }
}

impl Default for IndicatorRect {
    fn default() -> Self {
        Self::square(100)
    }
}

/// RGBA8 copy of the display surface, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl SurfaceImage {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.rgba.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}
