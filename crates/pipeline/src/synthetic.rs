//! Test-pattern camera used by the demo shell and the threaded tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::PipelineError;
use crate::frame::{Frame, FrameError, FrameSlot};
use crate::source::{
    choose_preview_size, CameraDevice, CameraInfo, CameraProvider, Facing, FpsRange,
};
use crate::types::PreviewGeometry;

pub const SUPPORTED_SIZES: [PreviewGeometry; 3] = [
    PreviewGeometry::new(1280, 720),
    PreviewGeometry::new(640, 480),
    PreviewGeometry::new(320, 240),
];

#[derive(Debug, Clone)]
pub struct SyntheticCameraProvider {
    facings: Vec<Facing>,
    sizes: Vec<PreviewGeometry>,
    interval: Duration,
}

impl SyntheticCameraProvider {
    pub fn new(facings: Vec<Facing>, interval: Duration) -> Self {
        Self {
            facings,
            sizes: SUPPORTED_SIZES.to_vec(),
            interval,
        }
    }

    pub fn with_sizes(mut self, sizes: Vec<PreviewGeometry>) -> Self {
        self.sizes = sizes;
        self
    }
}

impl Default for SyntheticCameraProvider {
    fn default() -> Self {
        Self::new(vec![Facing::Back, Facing::Front], Duration::from_millis(33))
    }
}

impl CameraProvider for SyntheticCameraProvider {
    fn cameras(&self) -> Vec<CameraInfo> {
        self.facings
            .iter()
            .enumerate()
            .map(|(index, facing)| CameraInfo {
                index,
                facing: *facing,
            })
            .collect()
    }

    fn open(
        &self,
        index: usize,
        desired: PreviewGeometry,
    ) -> Result<Box<dyn CameraDevice>, PipelineError> {
        if index >= self.facings.len() {
            return Err(PipelineError::Camera(format!("no synthetic camera {index}")));
        }
        let geometry = choose_preview_size(&self.sizes, desired)
            .ok_or_else(|| PipelineError::Camera("camera reports no preview sizes".into()))?;
        Ok(Box::new(SyntheticCamera {
            geometry,
            interval: self.interval,
            slot: None,
            producer: None,
        }))
    }
}

struct Producer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SyntheticCamera {
    geometry: PreviewGeometry,
    interval: Duration,
    slot: Option<FrameSlot>,
    producer: Option<Producer>,
}

impl CameraDevice for SyntheticCamera {
    fn preview_geometry(&self) -> PreviewGeometry {
        self.geometry
    }

    fn fps_range(&self) -> FpsRange {
        let millis = 1_000_000u128 / self.interval.as_millis().max(1);
        let millis = u32::try_from(millis).unwrap_or(u32::MAX);
        FpsRange {
            min_millis: millis,
            max_millis: millis,
        }
    }

    fn bind_target(&mut self, slot: FrameSlot) -> Result<(), PipelineError> {
        if self.producer.is_some() {
            return Err(PipelineError::Camera(
                "cannot rebind while producing frames".into(),
            ));
        }
        self.slot = Some(slot);
        Ok(())
    }

    fn start_production(&mut self) -> Result<(), PipelineError> {
        if self.producer.is_some() {
            return Ok(());
        }
        let slot = self
            .slot
            .clone()
            .ok_or_else(|| PipelineError::Camera("no target bound".into()))?;
        let (stop_tx, stop_rx) = bounded(0);
        let geometry = self.geometry;
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("dualcam-camera".into())
            .spawn(move || produce_frames(slot, geometry, interval, stop_rx))
            .map_err(|err| PipelineError::ThreadSpawn {
                name: "camera",
                reason: err.to_string(),
            })?;
        self.producer = Some(Producer { stop_tx, handle });
        tracing::debug!(%geometry, ?interval, "synthetic camera producing");
        Ok(())
    }

    fn stop_production(&mut self) {
        if let Some(producer) = self.producer.take() {
            drop(producer.stop_tx);
            if producer.handle.join().is_err() {
                tracing::error!("synthetic camera thread panicked");
            }
        }
    }

    fn release(&mut self) {
        self.stop_production();
        self.slot = None;
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop_production();
    }
}

fn produce_frames(
    slot: FrameSlot,
    geometry: PreviewGeometry,
    interval: Duration,
    stop_rx: Receiver<()>,
) {
    let started = Instant::now();
    let mut sequence = 0u64;
    loop {
        let frame = match Frame::new(
            geometry,
            test_pattern(geometry, sequence),
            started.elapsed(),
        ) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "synthetic frame rejected");
                return;
            }
        };
        match slot.publish(frame) {
            Ok(()) => sequence += 1,
            Err(FrameError::Released) => {
                tracing::debug!(sequence, "target texture released; producer exiting");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to publish synthetic frame");
                return;
            }
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(frames = sequence, "synthetic camera stopped");
}

/// Colour gradient with a white bar that moves four pixels per frame.
fn test_pattern(geometry: PreviewGeometry, sequence: u64) -> Arc<[u8]> {
    let (width, height) = (geometry.width.max(1), geometry.height.max(1));
    let bar_width = (width / 16).max(1);
    let bar_start = ((sequence * 4) % u64::from(width)) as u32;
    let mut pixels = Vec::with_capacity(geometry.pixel_count() * 4);
    for y in 0..geometry.height {
        for x in 0..geometry.width {
            let in_bar = x >= bar_start && x < bar_start + bar_width;
            if in_bar {
                pixels.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                pixels.extend_from_slice(&[r, g, 128, 255]);
            }
        }
    }
    pixels.into()
}
