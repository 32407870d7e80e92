use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use camconfig::{CameraFacing, DualcamConfig, Size};
use chrono::{DateTime, Local};
use pipeline::gpu::soft::SoftContext;
use pipeline::synthetic::SyntheticCameraProvider;
use pipeline::{
    EncoderCollaborator, EncoderWorker, Facing, GpuContext, GpuError, IndicatorRect,
    LifecycleOptions, LifecycleOwner, PreviewGeometry, RenderEvent, RendererOptions,
    SessionTemplate, SurfaceImage,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{Backend, Cli};
use crate::paths::AppPaths;
use crate::sink::ManifestSink;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Config file values with command-line overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend: Backend,
    pub facing: Facing,
    pub preview: PreviewGeometry,
    pub surface: Option<PreviewGeometry>,
    pub frame_interval: Duration,
    pub filter: u32,
    pub session: SessionTemplate,
    pub indicator: IndicatorRect,
    pub duration: Duration,
    pub record: bool,
    pub rotate: bool,
    pub restart: bool,
    pub snapshot: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: &DualcamConfig, now: DateTime<Local>) -> Self {
        let output = match &cli.output {
            Some(path) if path.is_dir() => path.join(timestamped_name(now)),
            Some(path) => path.clone(),
            None => config.recording.output.clone(),
        };
        Self {
            backend: cli.backend,
            facing: facing(cli.facing.unwrap_or(config.camera.facing)),
            preview: geometry(cli.size.unwrap_or(config.camera.preview)),
            surface: cli.surface.or(config.display.surface).map(geometry),
            frame_interval: config.camera.frame_interval,
            filter: cli.filter.unwrap_or(config.display.filter),
            session: SessionTemplate {
                output,
                bitrate: config.recording.bitrate,
                fallback_geometry: geometry(config.recording.fallback_size),
            },
            indicator: IndicatorRect::square(config.display.indicator_size),
            duration: cli.duration,
            record: cli.record,
            rotate: cli.rotate,
            restart: cli.restart,
            snapshot: cli.snapshot.clone(),
        }
    }
}

fn timestamped_name(now: DateTime<Local>) -> String {
    format!("dualcam-{}.mp4", now.format("%Y%m%d-%H%M%S"))
}

fn facing(facing: CameraFacing) -> Facing {
    match facing {
        CameraFacing::Front => Facing::Front,
        CameraFacing::Back => Facing::Back,
    }
}

fn geometry(size: Size) -> PreviewGeometry {
    PreviewGeometry::new(size.width, size.height)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli, &config, Local::now());
    tracing::debug!(?settings, "resolved dualcam settings");

    match settings.backend {
        Backend::Soft => run_session(&settings, || Ok(SoftContext::new())),
        Backend::Hardware => run_hardware(&settings),
    }
}

#[cfg(feature = "hardware")]
fn run_hardware(settings: &Settings) -> Result<()> {
    run_session(settings, pipeline::gpu::hardware::HardwareContext::new)
}

#[cfg(not(feature = "hardware"))]
fn run_hardware(_settings: &Settings) -> Result<()> {
    bail!("dualcam was built without the `hardware` feature; use --backend soft")
}

fn load_config(explicit: Option<&Path>) -> Result<DualcamConfig> {
    if let Some(path) = explicit {
        return DualcamConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }

    let paths = AppPaths::discover()?;
    let candidate = paths.config_file();
    if candidate.is_file() {
        tracing::debug!(path = %candidate.display(), "using discovered config");
        DualcamConfig::load(&candidate)
            .with_context(|| format!("failed to load config {}", candidate.display()))
    } else {
        tracing::debug!(
            config_dir = %paths.config_dir().display(),
            "no config file found; using defaults"
        );
        Ok(DualcamConfig::default())
    }
}

fn build_owner<G, F>(
    settings: &Settings,
    factory: F,
    encoder: &Arc<EncoderWorker>,
) -> Result<LifecycleOwner<SyntheticCameraProvider>>
where
    G: GpuContext + 'static,
    F: FnMut() -> Result<G, GpuError> + Send + 'static,
{
    let provider =
        SyntheticCameraProvider::new(vec![Facing::Back, Facing::Front], settings.frame_interval);
    let renderer = RendererOptions {
        session: settings.session.clone(),
        indicator: settings.indicator,
    };
    let options = LifecycleOptions {
        facing: settings.facing,
        desired_preview: settings.preview,
        surface: settings.surface,
    };
    let collaborator: Arc<dyn EncoderCollaborator> = encoder.clone();
    let mut owner = LifecycleOwner::new(provider, factory, collaborator, renderer, options)?;
    owner.resume()?;
    owner.set_filter(settings.filter)?;
    if let Some(facts) = owner.camera_facts() {
        tracing::info!(%facts, filter = settings.filter, "camera ready");
    }
    Ok(owner)
}

fn run_session<G, F>(settings: &Settings, factory: F) -> Result<()>
where
    G: GpuContext + 'static,
    F: FnMut() -> Result<G, GpuError> + Send + Clone + 'static,
{
    let encoder = Arc::new(EncoderWorker::spawn(ManifestSink::new())?);
    let mut owner = build_owner(settings, factory.clone(), &encoder)?;
    if settings.record {
        owner.set_recording(true)?;
    }

    let first_half = settings.duration / 2;
    pump(&mut owner, first_half)?;

    if settings.rotate {
        tracing::info!("rotating: releasing and recreating the render context");
        owner.pause()?;
        owner.resume()?;
    }

    if settings.restart {
        tracing::info!("restarting the lifecycle owner");
        owner.shutdown()?;
        owner = build_owner(settings, factory, &encoder)?;
    }

    pump(&mut owner, settings.duration.saturating_sub(first_half))?;

    if let Some(path) = &settings.snapshot {
        match owner.snapshot()? {
            Some(image) => write_snapshot(&image, path)?,
            None => tracing::warn!(
                path = %path.display(),
                "no display surface to read back; snapshot skipped"
            ),
        }
    }

    let status = owner.status()?;
    if owner.is_recording() {
        owner.set_recording(false)?;
        wait_for_stop(&mut owner, &encoder)?;
    }
    owner.shutdown()?;

    let stats = encoder.stats()?;
    encoder.shutdown();

    println!("frames drawn:    {}", status.frames_drawn);
    println!("filter:          {}", status.filter.map_or("none", |f| f.label()));
    println!("recompiles:      {}", status.recompiles);
    println!("frames encoded:  {}", stats.frames_encoded);
    println!("context updates: {}", stats.context_updates);
    if stats.sessions_started > 0 {
        println!("recording:       {}", settings.session.output.display());
    }
    Ok(())
}

/// Keeps the preview running for `duration`, surfacing render-thread events.
fn pump(owner: &mut LifecycleOwner<SyntheticCameraProvider>, duration: Duration) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        drain_events(owner)?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn wait_for_stop(
    owner: &mut LifecycleOwner<SyntheticCameraProvider>,
    encoder: &EncoderWorker,
) -> Result<()> {
    let deadline = Instant::now() + STOP_TIMEOUT;
    while encoder.is_session_active() {
        drain_events(owner)?;
        if Instant::now() >= deadline {
            tracing::warn!("recording still active at shutdown; the encoder will finish it");
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn drain_events(owner: &mut LifecycleOwner<SyntheticCameraProvider>) -> Result<()> {
    for event in owner.take_events() {
        match event {
            RenderEvent::RecordingFailed(err) => {
                tracing::warn!(error = %err, "recording could not start");
            }
            RenderEvent::ContextLost(err) => {
                tracing::warn!(error = %err, "render context lost; resuming");
                owner.pause()?;
                owner.resume()?;
            }
            RenderEvent::Failed(err) => {
                tracing::warn!(error = %err, "render command failed; preview continues");
            }
            RenderEvent::Fatal(err) => bail!("render thread stopped: {err}"),
        }
    }
    Ok(())
}

fn write_snapshot(image: &SurfaceImage, path: &Path) -> Result<()> {
    let buffer = image::RgbaImage::from_raw(image.width, image.height, image.rgba.clone())
        .context("surface image has an unexpected length")?;
    buffer
        .save(path)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    tracing::info!(path = %path.display(), width = image.width, height = image.height, "snapshot written");
    Ok(())
}
