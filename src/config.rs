use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("no detectors configured")]
    NoDetectors,
}

fn default_device() -> String {
    "0".to_string()
}

fn default_fps() -> u32 {
    10
}

fn default_warmup_secs() -> u64 {
    5
}

fn default_reopen_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,
    /// Unset means the capture stage keeps reopening the device forever.
    #[serde(default)]
    pub max_reopen_attempts: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            fps: default_fps(),
            warmup_secs: default_warmup_secs(),
            reopen_delay_ms: default_reopen_delay_ms(),
            max_reopen_attempts: None,
        }
    }
}

fn default_detector_stale_ms() -> u64 {
    1000
}

fn default_source_stale_ms() -> u64 {
    2000
}

fn default_retain() -> usize {
    2
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_detector_stale_ms")]
    pub detector_stale_ms: u64,
    #[serde(default = "default_source_stale_ms")]
    pub source_stale_ms: u64,
    #[serde(default = "default_retain")]
    pub source_retain: usize,
    #[serde(default = "default_retain")]
    pub result_retain: usize,
    #[serde(default = "default_retain")]
    pub output_retain: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector_stale_ms: default_detector_stale_ms(),
            source_stale_ms: default_source_stale_ms(),
            source_retain: default_retain(),
            result_retain: default_retain(),
            output_retain: default_retain(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_grayscale_threshold() -> f64 {
    15.0
}

fn default_min_contour_area() -> f64 {
    10.0
}

fn default_history_depth() -> usize {
    50
}

fn default_blur_size() -> i32 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_grayscale_threshold")]
    pub grayscale_threshold: f64,
    #[serde(default = "default_min_contour_area")]
    pub min_contour_area: f64,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    #[serde(default = "default_blur_size")]
    pub blur_size: i32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            grayscale_threshold: default_grayscale_threshold(),
            min_contour_area: default_min_contour_area(),
            history_depth: default_history_depth(),
            blur_size: default_blur_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    Motion(MotionConfig),
}

fn default_detectors() -> Vec<DetectorConfig> {
    vec![DetectorConfig::Motion(MotionConfig::default())]
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "default_detectors")]
    pub detectors: Vec<DetectorConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            pipeline: PipelineConfig::default(),
            detectors: default_detectors(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.fps == 0 {
            return Err(ConfigError::Invalid("capture.fps must be positive".into()));
        }

        if self.detectors.is_empty() {
            return Err(ConfigError::NoDetectors);
        }

        for detector in &self.detectors {
            match detector {
                DetectorConfig::Motion(motion) => {
                    if motion.history_depth == 0 {
                        return Err(ConfigError::Invalid(
                            "motion history_depth must be positive".into(),
                        ));
                    }
                    if motion.blur_size <= 0 {
                        return Err(ConfigError::Invalid(
                            "motion blur_size must be positive".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
