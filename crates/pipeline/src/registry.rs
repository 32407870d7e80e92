//! One-shot handoff of the render context's shared texture to the lifecycle owner.
//!
//! Each render-context (re)creation publishes exactly one
//! [`SharedTextureHandle`]; the lifecycle owner consumes it once to bind the
//! camera. The slot holds a single handle, so publishing again before the
//! previous handle was consumed is a lifecycle bug and reported as
//! [`PipelineError::InvariantViolation`] rather than overwriting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::PipelineError;
use crate::types::SharedTextureHandle;

/// A handle together with the epoch it was published in.
#[derive(Debug, Clone)]
pub struct PublishedSurface {
    pub epoch: u64,
    pub handle: SharedTextureHandle,
}

/// Render-context end of the registry.
#[derive(Debug, Clone)]
pub struct SurfacePublisher {
    tx: Sender<PublishedSurface>,
    epoch: Arc<AtomicU64>,
}

/// Lifecycle-owner end of the registry.
#[derive(Debug)]
pub struct SurfaceSubscriber {
    rx: Receiver<PublishedSurface>,
    epoch: Arc<AtomicU64>,
}

pub fn shared_surface_registry() -> (SurfacePublisher, SurfaceSubscriber) {
    let (tx, rx) = bounded(1);
    let epoch = Arc::new(AtomicU64::new(0));
    (
        SurfacePublisher {
            tx,
            epoch: epoch.clone(),
        },
        SurfaceSubscriber { rx, epoch },
    )
}

impl SurfacePublisher {
    /// Publishes the texture of a freshly created render context.
    ///
    /// Returns the epoch assigned to this publish.
    pub fn publish(&self, handle: SharedTextureHandle) -> Result<u64, PipelineError> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let published = PublishedSurface {
            epoch,
            handle: handle.clone(),
        };
        match self.tx.try_send(published) {
            Ok(()) => {
                tracing::debug!(texture = %handle, epoch, "published shared texture");
                Ok(epoch)
            }
            Err(TrySendError::Full(_)) => Err(PipelineError::invariant(format!(
                "shared texture {handle} published (epoch {epoch}) before the previous one was consumed"
            ))),
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(
                    texture = %handle,
                    epoch,
                    "lifecycle owner is gone; dropping shared texture publish"
                );
                Ok(epoch)
            }
        }
    }
}

impl SurfaceSubscriber {
    /// Blocks until the render context publishes its texture.
    pub fn consume(&self) -> Result<PublishedSurface, PipelineError> {
        self.rx
            .recv()
            .map_err(|_| PipelineError::Disconnected("render"))
    }

    /// Takes a pending publish without blocking.
    pub fn try_consume(&self) -> Result<Option<PublishedSurface>, PipelineError> {
        match self.rx.try_recv() {
            Ok(published) => Ok(Some(published)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PipelineError::Disconnected("render")),
        }
    }

    /// Epoch of the most recent publish attempt.
    pub fn latest_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSlot;
    use crate::types::{ContextId, TextureId};

    fn handle(id: u32) -> SharedTextureHandle {
        SharedTextureHandle::new(TextureId(id), ContextId::next(), FrameSlot::new())
    }

    #[test]
    fn publish_then_consume_hands_over_once() {
        let (publisher, subscriber) = shared_surface_registry();
        let texture = handle(1);
        let epoch = publisher.publish(texture.clone()).unwrap();
        assert_eq!(epoch, 1);

        let published = subscriber.consume().unwrap();
        assert_eq!(published.handle, texture);
        assert_eq!(published.epoch, 1);
        assert!(subscriber.try_consume().unwrap().is_none());
    }

    #[test]
    fn double_publish_is_an_invariant_violation() {
        let (publisher, subscriber) = shared_surface_registry();
        publisher.publish(handle(1)).unwrap();
        let err = publisher.publish(handle(2)).unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));

        // The first publish is still intact.
        assert_eq!(subscriber.consume().unwrap().handle.texture(), TextureId(1));
    }

    #[test]
    fn epochs_increase_across_recreations() {
        let (publisher, subscriber) = shared_surface_registry();
        publisher.publish(handle(1)).unwrap();
        subscriber.consume().unwrap();
        let second = publisher.publish(handle(2)).unwrap();
        assert_eq!(second, 2);
        assert_eq!(subscriber.consume().unwrap().epoch, 2);
        assert_eq!(subscriber.latest_epoch(), 2);
    }

    #[test]
    fn consume_reports_dropped_publisher() {
        let (publisher, subscriber) = shared_surface_registry();
        drop(publisher);
        assert_eq!(
            subscriber.consume().unwrap_err(),
            PipelineError::Disconnected("render")
        );
    }

    #[test]
    fn publish_without_subscriber_is_tolerated() {
        let (publisher, subscriber) = shared_surface_registry();
        drop(subscriber);
        assert!(publisher.publish(handle(3)).is_ok());
    }
}
