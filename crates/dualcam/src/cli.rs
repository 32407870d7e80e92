use std::path::PathBuf;
use std::time::Duration;

use camconfig::{CameraFacing, Size};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "dualcam",
    author,
    version,
    about = "Camera preview with a live shader filter and optional recording",
    arg_required_else_help = false
)]
pub struct Cli {
    /// Configuration file; defaults to `config.toml` in the user config dir.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// GPU backend used by the render context.
    #[arg(long, value_enum, default_value_t = Backend::default())]
    pub backend: Backend,

    /// Preferred camera: `front` or `back`.
    #[arg(long, value_name = "FACING", value_parser = parse_facing)]
    pub facing: Option<CameraFacing>,

    /// Desired preview size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<Size>,

    /// Display surface size; the preview size when omitted.
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub surface: Option<Size>,

    /// Filter name (`none`, `bw`, `blur`, `sharpen`, `edge`, `emboss`) or id 0-5.
    #[arg(long, value_name = "FILTER", value_parser = camconfig::parse_filter)]
    pub filter: Option<u32>,

    /// Recording output file, or a directory to receive a timestamped file.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// How long to keep the preview running (e.g. `3s`, `500ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "3s")]
    pub duration: Duration,

    /// Record for the whole run.
    #[arg(long)]
    pub record: bool,

    /// Pause and resume the render context halfway through the run.
    #[arg(long)]
    pub rotate: bool,

    /// Rebuild the lifecycle owner halfway through the run, keeping the encoder.
    #[arg(long)]
    pub restart: bool,

    /// Write a PNG of the display surface before exiting.
    #[arg(long, value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// CPU rasteriser; frames are readable by the encoder and snapshots.
    Soft,
    /// Headless wgpu device (requires the `hardware` feature).
    Hardware,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "hardware") {
            Self::Hardware
        } else {
            Self::Soft
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<Size, String> {
    let size: Size = value.parse()?;
    if size.is_empty() {
        return Err(format!("size {size} must be greater than zero"));
    }
    Ok(size)
}

pub fn parse_facing(value: &str) -> Result<CameraFacing, String> {
    value.parse()
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value.trim())
        .map_err(|err| format!("invalid duration '{value}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "dualcam",
            "--backend",
            "soft",
            "--size",
            "320x240",
            "--filter",
            "blur",
            "--duration",
            "250ms",
            "--record",
            "--rotate",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Soft);
        assert_eq!(cli.size, Some(Size::new(320, 240)));
        assert_eq!(cli.filter, Some(2));
        assert_eq!(cli.duration, Duration::from_millis(250));
        assert!(cli.record && cli.rotate && !cli.restart);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["dualcam", "--filter", "7"]).is_err());
        assert!(Cli::try_parse_from(["dualcam", "--size", "0x10"]).is_err());
        assert!(Cli::try_parse_from(["dualcam", "--facing", "side"]).is_err());
    }
}
