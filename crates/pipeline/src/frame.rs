//! Latest-frame buffer shared by the camera and the render context.
//!
//! The camera thread publishes frames, the render context latches them. Only
//! the newest unlatched frame is retained: a producer running ahead of the
//! renderer overwrites the pending frame instead of queueing it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{PreviewGeometry, IDENTITY_TRANSFORM};

/// Callback fired after each publish. Runs on the producer's thread.
pub type FrameListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame slot has been released")]
    Released,
    #[error("frame payload is {actual} bytes, expected {expected}")]
    PayloadSize { expected: usize, actual: usize },
}

/// One camera frame in RGBA8.
#[derive(Debug, Clone)]
pub struct Frame {
    pub geometry: PreviewGeometry,
    pub pixels: Arc<[u8]>,
    pub transform: [f32; 16],
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(
        geometry: PreviewGeometry,
        pixels: Arc<[u8]>,
        timestamp: Duration,
    ) -> Result<Self, FrameError> {
        let expected = geometry.pixel_count() * 4;
        if pixels.len() != expected {
            return Err(FrameError::PayloadSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            geometry,
            pixels,
            transform: IDENTITY_TRANSFORM,
            timestamp,
        })
    }

    pub fn with_transform(mut self, transform: [f32; 16]) -> Self {
        self.transform = transform;
        self
    }
}

#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<SlotInner>,
}

#[derive(Default)]
struct SlotInner {
    pending: Mutex<Option<Frame>>,
    listener: Mutex<Option<FrameListener>>,
    released: AtomicBool,
    published: AtomicU64,
    overwritten: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `frame` as the newest frame and fires the listener.
    pub fn publish(&self, frame: Frame) -> Result<(), FrameError> {
        if self.is_released() {
            return Err(FrameError::Released);
        }
        {
            let mut pending = self.inner.pending.lock();
            if pending.replace(frame).is_some() {
                self.inner.overwritten.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let listener = self.inner.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
        Ok(())
    }

    /// Takes the newest frame published since the last latch, if any.
    pub fn latch(&self) -> Option<Frame> {
        self.inner.pending.lock().take()
    }

    pub fn set_frame_listener(&self, listener: FrameListener) {
        *self.inner.listener.lock() = Some(listener);
    }

    pub fn clear_frame_listener(&self) {
        self.inner.listener.lock().take();
    }

    /// Detaches the slot from its texture; later publishes fail.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Release);
        self.inner.pending.lock().take();
        self.clear_frame_listener();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Frames replaced before the render context latched them.
    pub fn overwritten(&self) -> u64 {
        self.inner.overwritten.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn frame(seq: u64) -> Frame {
        let geometry = PreviewGeometry::new(2, 1);
        Frame::new(geometry, Arc::from(vec![seq as u8; 8]), Duration::from_millis(seq)).unwrap()
    }

    #[test]
    fn latch_returns_newest_frame_once() {
        let slot = FrameSlot::new();
        slot.publish(frame(1)).unwrap();
        slot.publish(frame(2)).unwrap();

        let latched = slot.latch().expect("frame");
        assert_eq!(latched.timestamp, Duration::from_millis(2));
        assert!(slot.latch().is_none());
        assert_eq!(slot.published(), 2);
        assert_eq!(slot.overwritten(), 1);
    }

    #[test]
    fn listener_fires_per_publish() {
        let slot = FrameSlot::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        slot.set_frame_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.publish(frame(1)).unwrap();
        slot.publish(frame(2)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn released_slot_rejects_frames() {
        let slot = FrameSlot::new();
        slot.publish(frame(1)).unwrap();
        slot.release();
        assert!(slot.latch().is_none());
        assert_eq!(slot.publish(frame(2)), Err(FrameError::Released));
    }

    #[test]
    fn payload_size_is_checked() {
        let err = Frame::new(
            PreviewGeometry::new(4, 4),
            Arc::from(vec![0u8; 3]),
            Duration::ZERO,
        )
        .unwrap_err();
        assert_eq!(
            err,
            FrameError::PayloadSize {
                expected: 64,
                actual: 3
            }
        );
    }
}
