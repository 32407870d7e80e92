use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipeline::filter::BLUR_KERNEL;
use pipeline::gpu::soft::SoftContext;
use pipeline::types::ContextId;
use pipeline::{
    shared_surface_registry, ContextRef, EncoderCollaborator, EncoderSession, FilterId,
    FilterVariant, Frame, FrameRenderer, PipelineError, PreviewGeometry,
    RecordingAction, RecordingState, RendererOptions, RendererPhase, SharedTextureHandle,
    SurfaceSubscriber,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Start(PreviewGeometry, u32),
    Update(ContextId),
    FrameReady,
    Stop,
}

#[derive(Default)]
struct ScriptedEncoder {
    active: Mutex<bool>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedEncoder {
    fn starts_and_updates(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| !matches!(call, Call::FrameReady))
            .cloned()
            .collect()
    }
}

impl EncoderCollaborator for ScriptedEncoder {
    fn is_session_active(&self) -> bool {
        *self.active.lock()
    }

    fn start_session(&self, session: EncoderSession) -> Result<(), PipelineError> {
        *self.active.lock() = true;
        self.calls
            .lock()
            .push(Call::Start(session.geometry, session.bitrate));
        Ok(())
    }

    fn update_shared_context(&self, context: ContextRef) {
        self.calls.lock().push(Call::Update(context.id()));
    }

    fn set_frame_source_identity(&self, _texture: &SharedTextureHandle) {}

    fn notify_frame_ready(&self, _texture: &SharedTextureHandle) {
        self.calls.lock().push(Call::FrameReady);
    }

    fn stop_session(&self) {
        *self.active.lock() = false;
        self.calls.lock().push(Call::Stop);
    }
}

fn renderer(
    encoder: &Arc<ScriptedEncoder>,
) -> (FrameRenderer<SoftContext>, SurfaceSubscriber) {
    let (publisher, subscriber) = shared_surface_registry();
    let collaborator: Arc<dyn EncoderCollaborator> = encoder.clone();
    (
        FrameRenderer::new(collaborator, publisher, RendererOptions::default()),
        subscriber,
    )
}

fn solid_frame(geometry: PreviewGeometry, rgba: [u8; 4]) -> Frame {
    let pixels: Vec<u8> = rgba
        .iter()
        .copied()
        .cycle()
        .take(geometry.pixel_count() * 4)
        .collect();
    Frame::new(geometry, pixels.into(), Duration::ZERO).unwrap()
}

#[test]
fn blur_then_record_then_stop() {
    let encoder = Arc::new(ScriptedEncoder::default());
    let (mut renderer, subscriber) = renderer(&encoder);
    assert_eq!(renderer.phase(), RendererPhase::Uninitialized);

    let handle = renderer.on_context_created(SoftContext::new()).unwrap();
    assert_eq!(renderer.phase(), RendererPhase::Active);
    assert_eq!(subscriber.consume().unwrap().handle, handle);

    renderer.set_preview_geometry(PreviewGeometry::new(1280, 720));
    renderer.set_filter(FilterId::try_from(2).unwrap());
    let report = renderer.tick().unwrap();
    assert!(report.recompiled);
    assert!(report.drew);
    assert_eq!(renderer.active_filter(), Some(FilterId::Blur));
    let spec = pipeline::select(2).unwrap();
    assert_eq!(spec.variant, FilterVariant::Convolve);
    assert_eq!(spec.kernel, Some(BLUR_KERNEL));
    assert_eq!(spec.color_bias, 0.0);
    assert_eq!(renderer.gpu().map(SoftContext::live_programs), Some(1));

    renderer.set_recording_requested(true);
    let report = renderer.tick().unwrap();
    assert_eq!(report.recording, RecordingAction::Started);
    assert_eq!(renderer.recording_state(), Some(RecordingState::On));
    assert_eq!(
        encoder.starts_and_updates(),
        vec![Call::Start(PreviewGeometry::new(1280, 720), 1_000_000)]
    );

    renderer.set_recording_requested(false);
    let report = renderer.tick().unwrap();
    assert_eq!(report.recording, RecordingAction::Stopped);
    assert_eq!(renderer.recording_state(), Some(RecordingState::Off));
    assert_eq!(encoder.starts_and_updates().last(), Some(&Call::Stop));
    assert!(!encoder.is_session_active());
}

#[test]
fn surviving_session_resumes_instead_of_restarting() {
    let encoder = Arc::new(ScriptedEncoder::default());
    *encoder.active.lock() = true;
    let (mut renderer, subscriber) = renderer(&encoder);

    let gpu = SoftContext::new();
    let context = gpu.id();
    renderer.on_context_created(gpu).unwrap();
    subscriber.consume().unwrap();
    assert_eq!(renderer.recording_state(), Some(RecordingState::Resumed));

    let report = renderer.tick().unwrap();
    assert_eq!(report.recording, RecordingAction::Resumed);
    assert_eq!(renderer.recording_state(), Some(RecordingState::On));
    assert_eq!(encoder.starts_and_updates(), vec![Call::Update(context)]);
}

#[test]
fn rotation_while_recording_resumes_on_new_context() {
    let encoder = Arc::new(ScriptedEncoder::default());
    let (mut renderer, subscriber) = renderer(&encoder);
    renderer.on_context_created(SoftContext::new()).unwrap();
    subscriber.consume().unwrap();
    renderer.set_recording_requested(true);
    renderer.tick().unwrap();

    renderer.pause();
    assert_eq!(renderer.phase(), RendererPhase::Paused);
    assert!(encoder.is_session_active());

    let gpu = SoftContext::new();
    let second = gpu.id();
    renderer.on_context_created(gpu).unwrap();
    subscriber.consume().unwrap();
    assert!(renderer.recording_requested());
    renderer.tick().unwrap();

    let calls = encoder.starts_and_updates();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], Call::Start(_, _)));
    assert_eq!(calls[1], Call::Update(second));
}

#[test]
fn unknown_geometry_still_notifies_encoder() {
    let encoder = Arc::new(ScriptedEncoder::default());
    let (mut renderer, subscriber) = renderer(&encoder);
    renderer.on_context_created(SoftContext::new()).unwrap();
    subscriber.consume().unwrap();

    let report = renderer.tick().unwrap();
    assert!(!report.drew);
    assert_eq!(*encoder.calls.lock(), vec![Call::FrameReady]);
}

#[test]
fn grayscale_and_indicator_reach_the_surface() {
    let encoder = Arc::new(ScriptedEncoder::default());
    let (mut renderer, subscriber) = renderer(&encoder);
    renderer.surface_changed(200, 150).unwrap();
    let handle = renderer.on_context_created(SoftContext::new()).unwrap();
    subscriber.consume().unwrap();
    renderer.surface_changed(200, 150).unwrap();

    let geometry = PreviewGeometry::new(4, 4);
    renderer.set_preview_geometry(geometry);
    renderer.set_filter(FilterId::BlackWhite);
    renderer.set_recording_requested(true);
    handle
        .slot()
        .publish(solid_frame(geometry, [200, 100, 50, 255]))
        .unwrap();

    let report = renderer.tick().unwrap();
    assert!(report.latched);
    assert!(report.indicator);

    let image = renderer.snapshot().unwrap().expect("soft surfaces read back");
    assert_eq!((image.width, image.height), (200, 150));
    // 0.3 * 200 + 0.59 * 100 + 0.11 * 50 = 124.5
    let grey = image.pixel(150, 10).unwrap();
    assert_eq!(grey[0], grey[1]);
    assert_eq!(grey[1], grey[2]);
    assert!((124..=125).contains(&grey[0]));
    assert_eq!(image.pixel(0, 149), Some([255, 0, 0, 255]));
    assert_eq!(image.pixel(99, 50), Some([255, 0, 0, 255]));
    assert_ne!(image.pixel(100, 149), Some([255, 0, 0, 255]));
}
