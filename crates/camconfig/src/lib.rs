use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Filter names accepted in `display.filter`, indexed by filter id.
pub const FILTER_NAMES: [&str; 6] = ["none", "bw", "blur", "sharpen", "edge", "emboss"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl FromStr for CameraFacing {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(Self::Front),
            "back" | "rear" => Ok(Self::Back),
            other => Err(format!("invalid camera facing '{other}'; expected front or back")),
        }
    }
}

/// A `WIDTHxHEIGHT` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (width, height) = raw
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid size '{raw}'; expected WIDTHxHEIGHT"))?;
        let width = width
            .trim()
            .parse()
            .map_err(|_| format!("invalid width in '{raw}'"))?;
        let height = height
            .trim()
            .parse()
            .map_err(|_| format!("invalid height in '{raw}'"))?;
        Ok(Self { width, height })
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Resolves a filter name or numeric id to the filter id.
pub fn parse_filter(raw: &str) -> Result<u32, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if let Ok(id) = normalized.parse::<u32>() {
        return if (id as usize) < FILTER_NAMES.len() {
            Ok(id)
        } else {
            Err(format!("filter id {id} out of range 0..={}", FILTER_NAMES.len() - 1))
        };
    }
    let alias = match normalized.as_str() {
        "off" | "identity" => "none",
        "grayscale" | "greyscale" | "gray" | "grey" => "bw",
        "edges" | "edge-detect" => "edge",
        other => other,
    };
    FILTER_NAMES
        .iter()
        .position(|name| *name == alias)
        .map(|id| id as u32)
        .ok_or_else(|| {
            format!(
                "unknown filter '{normalized}'; expected one of {}",
                FILTER_NAMES.join(", ")
            )
        })
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DualcamConfig {
    pub version: u32,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    pub facing: CameraFacing,
    pub preview: Size,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub frame_interval: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Front,
            preview: Size::new(1280, 720),
            frame_interval: Duration::from_millis(33),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub output: PathBuf,
    pub bitrate: u32,
    pub fallback_size: Size,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("camera-test.mp4"),
            bitrate: 1_000_000,
            fallback_size: Size::new(640, 480),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(deserialize_with = "deserialize_filter")]
    pub filter: u32,
    pub surface: Option<Size>,
    pub indicator_size: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            filter: 0,
            surface: None,
            indicator_size: 100,
        }
    }
}

impl Default for DualcamConfig {
    fn default() -> Self {
        Self {
            version: 1,
            camera: CameraConfig::default(),
            recording: RecordingConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

fn serialize_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*value))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of milliseconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_millis(v as u64))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn deserialize_filter<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Str(String),
        Num(i64),
    }

    match Helper::deserialize(deserializer)? {
        Helper::Str(raw) => parse_filter(&raw).map_err(de::Error::custom),
        Helper::Num(value) if value < 0 => {
            Err(de::Error::custom("filter id must be non-negative"))
        }
        Helper::Num(value) => parse_filter(&value.to_string()).map_err(de::Error::custom),
    }
}

impl DualcamConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: DualcamConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn filter_name(&self) -> &'static str {
        FILTER_NAMES
            .get(self.display.filter as usize)
            .copied()
            .unwrap_or("none")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.camera.preview.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "camera.preview {} must be non-zero in both dimensions",
                self.camera.preview
            )));
        }

        if self.camera.frame_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "camera.frame_interval must be greater than zero".into(),
            ));
        }

        if self.recording.bitrate == 0 {
            return Err(ConfigError::Invalid(
                "recording.bitrate must be greater than zero".into(),
            ));
        }

        if self.recording.output.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("recording.output may not be empty".into()));
        }

        if self.recording.fallback_size.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "recording.fallback_size {} must be non-zero in both dimensions",
                self.recording.fallback_size
            )));
        }

        if let Some(surface) = self.display.surface {
            if surface.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "display.surface {surface} must be non-zero in both dimensions"
                )));
            }
        }

        if self.display.filter as usize >= FILTER_NAMES.len() {
            return Err(ConfigError::Invalid(format!(
                "display.filter {} is not a known filter",
                self.display.filter
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[camera]
facing = "back"
preview = "640x480"
frame_interval = "40ms"

[recording]
output = "take.mp4"
bitrate = 2000000
fallback_size = "320x240"

[display]
filter = "emboss"
surface = "800x600"
indicator_size = 64
"#;

    #[test]
    fn parses_sample_config() {
        let config = DualcamConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.camera.facing, CameraFacing::Back);
        assert_eq!(config.camera.preview, Size::new(640, 480));
        assert_eq!(config.camera.frame_interval, Duration::from_millis(40));
        assert_eq!(config.recording.output, PathBuf::from("take.mp4"));
        assert_eq!(config.recording.bitrate, 2_000_000);
        assert_eq!(config.recording.fallback_size, Size::new(320, 240));
        assert_eq!(config.display.filter, 5);
        assert_eq!(config.filter_name(), "emboss");
        assert_eq!(config.display.surface, Some(Size::new(800, 600)));
        assert_eq!(config.display.indicator_size, 64);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = DualcamConfig::from_toml_str("version = 1\n").unwrap();
        assert_eq!(config, DualcamConfig::default());
        assert_eq!(config.recording.output, PathBuf::from("camera-test.mp4"));
        assert_eq!(config.recording.bitrate, 1_000_000);
        assert_eq!(config.camera.preview, Size::new(1280, 720));
    }

    #[test]
    fn filter_accepts_numbers_and_aliases() {
        let numeric = DualcamConfig::from_toml_str("version = 1\n[display]\nfilter = 2\n").unwrap();
        assert_eq!(numeric.display.filter, 2);
        assert_eq!(parse_filter("Grayscale"), Ok(1));
        assert_eq!(parse_filter("4"), Ok(4));
        assert!(parse_filter("6").is_err());
        assert!(parse_filter("sepia").is_err());
    }

    #[test]
    fn rejects_unknown_filter() {
        let err =
            DualcamConfig::from_toml_str("version = 1\n[display]\nfilter = 9\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_bitrate_and_sizes() {
        let err = DualcamConfig::from_toml_str("version = 1\n[recording]\nbitrate = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = DualcamConfig::from_toml_str("version = 1\n[camera]\npreview = \"0x720\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_wrong_version() {
        let err = DualcamConfig::from_toml_str("version = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DualcamConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = DualcamConfig::load(&path).unwrap();
        assert_eq!(config.display.filter, 5);
    }

    #[test]
    fn size_parsing() {
        assert_eq!("1280x720".parse::<Size>(), Ok(Size::new(1280, 720)));
        assert_eq!(" 64X48 ".parse::<Size>(), Ok(Size::new(64, 48)));
        assert!("1280".parse::<Size>().is_err());
        assert!("axb".parse::<Size>().is_err());
        assert_eq!(Size::new(640, 480).to_string(), "640x480");
    }
}
