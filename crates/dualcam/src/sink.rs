//! Video sink for the demo shell.
//!
//! Container encoding lives outside this workspace; the sink writes a frame
//! manifest instead: one line per encoded frame with a checksum of the pixels
//! it could read through the shared context.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
#[cfg(feature = "hardware")]
use pipeline::gpu::hardware::HardwareShareGroup;
use pipeline::gpu::soft::SoftShareGroup;
use pipeline::{ContextRef, EncoderSession, SharedTextureHandle, VideoSink};

/// Host-side access to the textures of the recording context.
enum SharedPixels {
    Soft(Arc<SoftShareGroup>),
    #[cfg(feature = "hardware")]
    Hardware(Arc<HardwareShareGroup>),
}

impl SharedPixels {
    fn of(context: &ContextRef) -> Option<Self> {
        if let Some(share) = context.share_group::<SoftShareGroup>() {
            return Some(Self::Soft(share));
        }
        #[cfg(feature = "hardware")]
        if let Some(share) = context.share_group::<HardwareShareGroup>() {
            return Some(Self::Hardware(share));
        }
        tracing::warn!(context = %context.id(), "unknown share group; frames get no checksum");
        None
    }

    fn checksum(&self, texture: &SharedTextureHandle) -> Option<u64> {
        match self {
            Self::Soft(share) => share
                .latched(texture.texture())
                .map(|frame| fnv1a(&frame.pixels)),
            #[cfg(feature = "hardware")]
            Self::Hardware(share) => match share.read_texture(texture) {
                Ok(pixels) => pixels.map(|pixels| fnv1a(&pixels)),
                Err(err) => {
                    tracing::warn!(error = %err, %texture, "frame readback failed");
                    None
                }
            },
        }
    }
}

#[derive(Default)]
pub struct ManifestSink {
    output: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    share: Option<SharedPixels>,
    frames: u64,
}

impl ManifestSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer.as_mut().context("no session in progress")
    }
}

impl VideoSink for ManifestSink {
    fn begin(&mut self, session: &EncoderSession) -> Result<()> {
        if let Some(parent) = session.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(&session.output)
            .with_context(|| format!("failed to create {}", session.output.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "# dualcam {} {}bps {}",
            session.geometry,
            session.bitrate,
            session.context.id()
        )?;
        self.writer = Some(writer);
        self.output = Some(session.output.clone());
        self.share = SharedPixels::of(&session.context);
        self.frames = 0;
        tracing::info!(output = %session.output.display(), "recording manifest opened");
        Ok(())
    }

    fn update_context(&mut self, context: &ContextRef) -> Result<()> {
        self.share = SharedPixels::of(context);
        writeln!(self.writer()?, "context {}", context.id())?;
        Ok(())
    }

    fn encode_frame(&mut self, texture: &SharedTextureHandle) -> Result<()> {
        let checksum = self
            .share
            .as_ref()
            .and_then(|share| share.checksum(texture))
            .map(|checksum| format!("{checksum:016x}"))
            .unwrap_or_else(|| "-".to_string());
        let index = self.frames;
        writeln!(self.writer()?, "frame {index} {texture} {checksum}")?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let frames = self.frames;
        let mut writer = self.writer.take().context("no session in progress")?;
        writeln!(writer, "# frames {frames}")?;
        writer.flush().context("failed to flush recording manifest")?;
        if let Some(output) = self.output.take() {
            tracing::info!(output = %output.display(), frames, "recording manifest closed");
        }
        self.share = None;
        Ok(())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pipeline::gpu::soft::SoftContext;
    use pipeline::{Frame, GpuContext, PreviewGeometry};

    #[test]
    fn writes_header_frames_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/take.mp4");
        let mut gpu = SoftContext::new();
        let texture = gpu.create_external_texture().unwrap();
        let context = gpu.context_ref();

        let mut sink = ManifestSink::new();
        sink.begin(&EncoderSession {
            output: output.clone(),
            geometry: PreviewGeometry::new(640, 480),
            bitrate: 1_000_000,
            context: context.clone(),
        })
        .unwrap();
        sink.encode_frame(&texture).unwrap();
        sink.update_context(&context).unwrap();
        sink.finish().unwrap();

        let written = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], format!("# dualcam 640x480 1000000bps {}", context.id()));
        assert_eq!(lines[1], format!("frame 0 {texture} -"));
        assert_eq!(lines[2], format!("context {}", context.id()));
        assert_eq!(lines[3], "# frames 1");
    }

    #[test]
    fn latched_frames_get_a_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("take.mp4");
        let geometry = PreviewGeometry::new(2, 2);
        let mut gpu = SoftContext::new();
        let texture = gpu.create_external_texture().unwrap();
        let pixels: Arc<[u8]> = Arc::from(vec![7u8; geometry.pixel_count() * 4]);
        let frame = Frame::new(geometry, pixels.clone(), Duration::ZERO).unwrap();
        texture.slot().publish(frame).unwrap();
        gpu.latch(&texture).unwrap();

        let mut sink = ManifestSink::new();
        sink.begin(&EncoderSession {
            output: output.clone(),
            geometry,
            bitrate: 1_000_000,
            context: gpu.context_ref(),
        })
        .unwrap();
        sink.encode_frame(&texture).unwrap();
        sink.finish().unwrap();

        let written = fs::read_to_string(&output).unwrap();
        let expected = format!("frame 0 {texture} {:016x}", fnv1a(&pixels));
        assert!(written.lines().any(|line| line == expected), "{written}");
    }

    #[test]
    fn frame_without_session_is_an_error() {
        let mut gpu = SoftContext::new();
        let texture = gpu.create_external_texture().unwrap();
        let mut sink = ManifestSink::new();
        assert!(sink.encode_frame(&texture).is_err());
        assert!(sink.finish().is_err());
    }

    #[test]
    fn checksum_is_stable() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
    }
}
