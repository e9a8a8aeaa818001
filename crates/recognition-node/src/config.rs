use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Local, Offset};
use common::validation::{
    validate_duration_ms, validate_id, validate_range, validate_unit_interval, validate_uri,
};
use reqwest::Url;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Thresholds of the quality filter
#[derive(Debug, Clone, PartialEq)]
pub struct QualityConfig {
    /// Shorter bounding-box side must be at least this many pixels
    pub min_face_px: f32,
    /// Bounding-box area may not exceed this fraction of the frame
    pub max_area_ratio: f32,
    /// Accepted width/height band
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Laplacian variance floor of the face region
    pub min_sharpness: f64,
    /// Raw detector confidence floor
    pub min_confidence: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_face_px: 40.0,
            max_area_ratio: 0.6,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 1.4,
            min_sharpness: 20.0,
            min_confidence: 0.5,
        }
    }
}

impl QualityConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            min_face_px: env_parse("QUALITY_MIN_FACE_PX", defaults.min_face_px)?,
            max_area_ratio: env_parse("QUALITY_MAX_AREA_RATIO", defaults.max_area_ratio)?,
            min_aspect_ratio: env_parse("QUALITY_MIN_ASPECT", defaults.min_aspect_ratio)?,
            max_aspect_ratio: env_parse("QUALITY_MAX_ASPECT", defaults.max_aspect_ratio)?,
            min_sharpness: env_parse("QUALITY_MIN_SHARPNESS", defaults.min_sharpness)?,
            min_confidence: env_parse("QUALITY_MIN_CONFIDENCE", defaults.min_confidence)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_face_px.is_finite() && self.min_face_px >= 0.0) {
            bail!("QUALITY_MIN_FACE_PX must be a non-negative number");
        }
        validate_unit_interval(self.max_area_ratio, "QUALITY_MAX_AREA_RATIO")?;
        validate_unit_interval(self.min_confidence, "QUALITY_MIN_CONFIDENCE")?;
        if !(self.min_aspect_ratio > 0.0 && self.min_aspect_ratio <= self.max_aspect_ratio) {
            bail!(
                "aspect ratio band is invalid: QUALITY_MIN_ASPECT={} QUALITY_MAX_ASPECT={}",
                self.min_aspect_ratio,
                self.max_aspect_ratio
            );
        }
        if !(self.min_sharpness.is_finite() && self.min_sharpness >= 0.0) {
            bail!("QUALITY_MIN_SHARPNESS must be a non-negative number");
        }
        Ok(())
    }
}

/// Identity matching parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Cosine similarity a match must meet or exceed
    pub threshold: f32,
    /// Nearest neighbours fetched per query
    pub top_k: usize,
    /// Margin added around the bbox before embedding, as a fraction of its size
    pub crop_margin: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            top_k: 5,
            crop_margin: 0.2,
        }
    }
}

impl MatchConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            threshold: env_parse("RECOGNITION_THRESHOLD", defaults.threshold)?,
            top_k: env_parse("MATCH_TOP_K", defaults.top_k)?,
            crop_margin: env_parse("FACE_CROP_MARGIN", defaults.crop_margin)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_unit_interval(self.threshold, "RECOGNITION_THRESHOLD")?;
        validate_range(self.top_k, 1, 100, "MATCH_TOP_K")?;
        validate_unit_interval(self.crop_margin, "FACE_CROP_MARGIN")?;
        Ok(())
    }
}

/// The two cadence tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceConfig {
    pub focused: Duration,
    pub background: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            focused: Duration::from_millis(1000),
            background: Duration::from_millis(3000),
        }
    }
}

impl CadenceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            focused: env_millis("CADENCE_FOCUSED_MS", defaults.focused)?,
            background: env_millis("CADENCE_BACKGROUND_MS", defaults.background)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_duration_ms(self.focused.as_millis() as u64, "CADENCE_FOCUSED_MS")?;
        validate_duration_ms(self.background.as_millis() as u64, "CADENCE_BACKGROUND_MS")?;
        if self.focused > self.background {
            bail!(
                "CADENCE_FOCUSED_MS ({:?}) must not be slower than CADENCE_BACKGROUND_MS ({:?})",
                self.focused,
                self.background
            );
        }
        Ok(())
    }

    pub fn for_priority(&self, priority: common::attendance::CameraPriority) -> Duration {
        match priority {
            common::attendance::CameraPriority::Focused => self.focused,
            common::attendance::CameraPriority::Background => self.background,
        }
    }
}

/// Bounded timeouts for every external call made during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub frame: Duration,
    pub detect: Duration,
    pub embed: Duration,
    pub gallery: Duration,
    pub ledger: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            frame: Duration::from_millis(5000),
            detect: Duration::from_millis(3000),
            embed: Duration::from_millis(2000),
            gallery: Duration::from_millis(1000),
            ledger: Duration::from_millis(2000),
        }
    }
}

impl TimeoutConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            frame: env_millis("TIMEOUT_FRAME_MS", defaults.frame)?,
            detect: env_millis("TIMEOUT_DETECT_MS", defaults.detect)?,
            embed: env_millis("TIMEOUT_EMBED_MS", defaults.embed)?,
            gallery: env_millis("TIMEOUT_GALLERY_MS", defaults.gallery)?,
            ledger: env_millis("TIMEOUT_LEDGER_MS", defaults.ledger)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (value, name) in [
            (self.frame, "TIMEOUT_FRAME_MS"),
            (self.detect, "TIMEOUT_DETECT_MS"),
            (self.embed, "TIMEOUT_EMBED_MS"),
            (self.gallery, "TIMEOUT_GALLERY_MS"),
            (self.ledger, "TIMEOUT_LEDGER_MS"),
        ] {
            validate_duration_ms(value.as_millis() as u64, name)?;
        }
        Ok(())
    }
}

/// Engine tuning shared by every camera scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub quality: QualityConfig,
    pub matching: MatchConfig,
    pub cadence: CadenceConfig,
    pub timeouts: TimeoutConfig,
    /// Consecutive skipped ticks after which a camera is reported overloaded
    pub overload_skip_threshold: u32,
    /// Offset of the ledger's local clock; defines the calendar day of a record
    pub day_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quality: QualityConfig::default(),
            matching: MatchConfig::default(),
            cadence: CadenceConfig::default(),
            timeouts: TimeoutConfig::default(),
            overload_skip_threshold: 5,
            day_offset: Local::now().offset().fix(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let day_offset = match env::var("ATTENDANCE_UTC_OFFSET_MINUTES") {
            Ok(raw) => {
                let minutes: i32 = raw
                    .trim()
                    .parse()
                    .context("Invalid ATTENDANCE_UTC_OFFSET_MINUTES")?;
                FixedOffset::east_opt(minutes * 60)
                    .context("ATTENDANCE_UTC_OFFSET_MINUTES is out of range")?
            }
            Err(_) => Local::now().offset().fix(),
        };

        let config = Self {
            quality: QualityConfig::from_env()?,
            matching: MatchConfig::from_env()?,
            cadence: CadenceConfig::from_env()?,
            timeouts: TimeoutConfig::from_env()?,
            overload_skip_threshold: env_parse("OVERLOAD_SKIP_THRESHOLD", 5u32)?,
            day_offset,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.quality.validate()?;
        self.matching.validate()?;
        self.cadence.validate()?;
        self.timeouts.validate()?;
        if self.overload_skip_threshold == 0 {
            bail!("OVERLOAD_SKIP_THRESHOLD must be greater than 0");
        }
        Ok(())
    }
}

/// A camera declared through `CAMERAS` when no database registry is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCamera {
    pub camera_id: String,
    pub source_uri: String,
}

#[derive(Debug, Clone)]
pub struct RecognitionNodeConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Node ID for this recognition node instance
    pub node_id: String,

    /// JSON gallery file with the enrolled identities
    pub gallery_path: PathBuf,

    /// Postgres URL for the attendance ledger and camera registry (optional)
    pub database_url: Option<String>,

    /// Detector/embedder service endpoint
    pub inference_url: Url,

    /// Cameras used when no database registry is configured
    pub static_cameras: Vec<StaticCamera>,

    /// How often the camera registry is polled
    pub registry_poll_interval: Duration,

    /// Serve synthetic frames and faces instead of ffmpeg and the inference service
    pub mock_inference: bool,

    pub engine: EngineConfig,
}

impl RecognitionNodeConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("NODE_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".to_string());

        let node_id = env::var("NODE_ID").unwrap_or_else(|_| {
            format!(
                "recognition-node-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            )
        });

        let gallery_path = env::var("GALLERY_PATH")
            .map(PathBuf::from)
            .context("GALLERY_PATH must be set")?;

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());

        let inference_url = Url::parse(
            &env::var("INFERENCE_URL").unwrap_or_else(|_| "http://localhost:8084".to_string()),
        )
        .context("Invalid INFERENCE_URL")?;

        let static_cameras = parse_static_cameras(&env::var("CAMERAS").unwrap_or_default())?;

        let registry_poll_interval =
            Duration::from_secs(env_parse("REGISTRY_POLL_SECS", 10u64)?.max(1));

        Ok(Self {
            bind_addr,
            node_id,
            gallery_path,
            database_url,
            inference_url,
            static_cameras,
            registry_poll_interval,
            mock_inference: env_parse("MOCK_INFERENCE", false)?,
            engine: EngineConfig::from_env()?,
        })
    }
}

/// Parse `id=uri,id=uri` into static camera declarations
pub fn parse_static_cameras(raw: &str) -> Result<Vec<StaticCamera>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (camera_id, source_uri) = entry
                .split_once('=')
                .with_context(|| format!("CAMERAS entry '{}' must be id=uri", entry))?;
            let camera_id = camera_id.trim().to_string();
            let source_uri = source_uri.trim().to_string();
            validate_id(&camera_id, "camera_id")?;
            validate_uri(&source_uri, "camera source uri")?;
            Ok(StaticCamera {
                camera_id,
                source_uri,
            })
        })
        .collect()
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::attendance::CameraPriority;

    #[test]
    fn test_engine_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.threshold, 0.55);
        assert_eq!(config.matching.top_k, 5);
        assert_eq!(config.quality.min_face_px, 40.0);
        assert_eq!(config.cadence.focused, Duration::from_millis(1000));
        assert_eq!(config.cadence.background, Duration::from_millis(3000));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = EngineConfig::default();
        config.matching.threshold = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_aspect_band_rejected() {
        let mut config = EngineConfig::default();
        config.quality.min_aspect_ratio = 2.0;
        config.quality.max_aspect_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_focused_cadence_must_not_be_slower() {
        let mut config = EngineConfig::default();
        config.cadence.focused = Duration::from_secs(10);
        assert!(config.validate().is_err());

        config.cadence.focused = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cadence_for_priority() {
        let cadence = CadenceConfig::default();
        assert_eq!(cadence.for_priority(CameraPriority::Focused), cadence.focused);
        assert_eq!(cadence.for_priority(CameraPriority::Background), cadence.background);
    }

    #[test]
    fn test_parse_static_cameras() {
        let cameras =
            parse_static_cameras("lobby=rtsp://10.0.0.5/stream, hall = rtsp://10.0.0.6/live ,")
                .unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].camera_id, "lobby");
        assert_eq!(cameras[1].camera_id, "hall");
        assert_eq!(cameras[1].source_uri, "rtsp://10.0.0.6/live");

        assert!(parse_static_cameras("").unwrap().is_empty());
        assert!(parse_static_cameras("lobby").is_err());
        assert!(parse_static_cameras("lobby=rtsp://cam;reboot").is_err());
    }
}
