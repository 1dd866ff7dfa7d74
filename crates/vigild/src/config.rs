use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which frame processor the streaming loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    Face,
    Weapon,
}

impl FromStr for Pipeline {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "face" => Ok(Self::Face),
            "weapon" => Ok(Self::Weapon),
            other => Err(ConfigError::Invalid(format!(
                "unknown pipeline {other:?} (expected face or weapon)"
            ))),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file, then `VIGIL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device index, `/dev` path, http(s) URL, image directory, or file.
    pub source: String,
    pub pipeline: Pipeline,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory of `<label>_embedding.npy` files.
    pub reference_dir: PathBuf,
    /// Where accepted upload originals are kept.
    pub uploads_dir: PathBuf,
    /// Cosine similarity a face must exceed to match a reference.
    pub similarity_threshold: f32,
    /// Minimum score for weapon detections.
    pub confidence_threshold: f32,
    pub weapon_classes: Vec<usize>,
    /// Display names indexed by class id.
    pub weapon_class_names: Vec<String>,
    pub jpeg_quality: u8,
    /// Consecutive failed reads that end the stream.
    pub max_read_failures: u32,
    pub http_addr: SocketAddr,
    pub stream_poll_interval_ms: u64,
    /// Start streaming as soon as the daemon is up.
    pub autostart: bool,
    pub dbus_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            source: "0".to_string(),
            pipeline: Pipeline::Face,
            model_dir: vigil_core::default_model_dir(),
            reference_dir: data_dir.join("embeddings"),
            uploads_dir: data_dir.join("uploads"),
            similarity_threshold: 0.7,
            confidence_threshold: 0.5,
            weapon_classes: vec![0],
            weapon_class_names: vec!["pistol".to_string()],
            jpeg_quality: 80,
            max_read_failures: 30,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            stream_poll_interval_ms: 40,
            autostart: true,
            dbus_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("VIGIL_CONFIG").map(PathBuf::from);
        let mut config = match (&explicit, default_config_path()) {
            (Some(path), _) => Self::from_file(path)?,
            (None, Some(path)) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `VIGIL_*` variables; unparseable values are ignored.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("VIGIL_SOURCE") {
            self.source = v;
        }
        if let Some(v) = env_parse(&get, "VIGIL_PIPELINE") {
            self.pipeline = v;
        }
        if let Some(v) = get("VIGIL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIGIL_REFERENCE_DIR") {
            self.reference_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIGIL_UPLOADS_DIR") {
            self.uploads_dir = PathBuf::from(v);
        }
        self.similarity_threshold = env_f32(&get, "VIGIL_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.confidence_threshold = env_f32(&get, "VIGIL_CONFIDENCE_THRESHOLD", self.confidence_threshold);
        if let Some(v) = get("VIGIL_WEAPON_CLASSES") {
            match v.split(',').map(|s| s.trim().parse()).collect::<Result<Vec<usize>, _>>() {
                Ok(classes) => self.weapon_classes = classes,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid VIGIL_WEAPON_CLASSES"),
            }
        }
        if let Some(v) = get("VIGIL_WEAPON_CLASS_NAMES") {
            self.weapon_class_names = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        self.jpeg_quality = env_parse(&get, "VIGIL_JPEG_QUALITY").unwrap_or(self.jpeg_quality);
        self.max_read_failures = env_parse(&get, "VIGIL_MAX_READ_FAILURES").unwrap_or(self.max_read_failures);
        self.http_addr = env_parse(&get, "VIGIL_HTTP_ADDR").unwrap_or(self.http_addr);
        self.stream_poll_interval_ms = env_u64(&get, "VIGIL_STREAM_POLL_INTERVAL_MS", self.stream_poll_interval_ms);
        self.autostart = env_bool(&get, "VIGIL_AUTOSTART", self.autostart);
        self.dbus_enabled = env_bool(&get, "VIGIL_DBUS_ENABLED", self.dbus_enabled);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality {} outside 1..=100",
                self.jpeg_quality
            )));
        }
        if self.max_read_failures == 0 {
            return Err(ConfigError::Invalid("max_read_failures must be at least 1".into()));
        }
        if self.source.trim().is_empty() {
            return Err(ConfigError::Invalid("source is empty".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path(vigil_core::FACE_DETECTOR_MODEL)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path(vigil_core::FACE_RECOGNIZER_MODEL)
    }

    /// Path to the YOLO weapon model.
    pub fn weapon_model_path(&self) -> String {
        self.model_path(vigil_core::WEAPON_MODEL)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("vigil/config.toml"))
}

fn env_parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
    }
    parsed
}

fn env_f32(get: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    env_parse(get, key).unwrap_or(default)
}

fn env_u64(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env_parse(get, key).unwrap_or(default)
}

fn env_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    get(key).map(|v| v != "0" && !v.eq_ignore_ascii_case("false")).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pipeline, Pipeline::Face);
        assert!((config.similarity_threshold - 0.7).abs() < 1e-6);
        assert!((config.confidence_threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.weapon_classes, vec![0]);
        assert_eq!(config.http_addr.port(), 5001);
        assert!(config.validate().is_ok());
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_toml_overrides_only_given_keys() {
        let config = Config::from_toml(
            r#"
            source = "http://cam.local/video"
            pipeline = "weapon"
            confidence_threshold = 0.35
            weapon_class_names = ["pistol", "knife"]
            "#,
        )
        .unwrap();
        assert_eq!(config.source, "http://cam.local/video");
        assert_eq!(config.pipeline, Pipeline::Weapon);
        assert!((config.confidence_threshold - 0.35).abs() < 1e-6);
        assert_eq!(config.weapon_class_names.len(), 2);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml("camera_device = \"/dev/video2\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("VIGIL_SOURCE", "/srv/frames"),
            ("VIGIL_PIPELINE", "Weapon"),
            ("VIGIL_SIMILARITY_THRESHOLD", "0.55"),
            ("VIGIL_WEAPON_CLASSES", "0, 2"),
            ("VIGIL_HTTP_ADDR", "127.0.0.1:8080"),
            ("VIGIL_AUTOSTART", "0"),
            ("VIGIL_DBUS_ENABLED", "false"),
        ]));
        assert_eq!(config.source, "/srv/frames");
        assert_eq!(config.pipeline, Pipeline::Weapon);
        assert!((config.similarity_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.weapon_classes, vec![0, 2]);
        assert_eq!(config.http_addr.port(), 8080);
        assert!(!config.autostart);
        assert!(!config.dbus_enabled);
    }

    #[test]
    fn test_env_ignores_garbage() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("VIGIL_SIMILARITY_THRESHOLD", "high"),
            ("VIGIL_WEAPON_CLASSES", "a,b"),
            ("VIGIL_PIPELINE", "audio"),
        ]));
        assert!((config.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.weapon_classes, vec![0]);
        assert_eq!(config.pipeline, Pipeline::Face);
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config {
            confidence_threshold: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        config.confidence_threshold = 0.5;
        config.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.jpeg_quality = 90;
        config.max_read_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::from_file(&dir.path().join("nope.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
