use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::faces::QueryFaceSelection;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory that holds stored uploads and generated reports.
    #[serde(default = "default_media_root")]
    pub root: PathBuf,

    /// Prefix the static file server exposes `root` under.
    #[serde(default = "default_media_url_prefix")]
    pub url_prefix: String,
}

fn default_media_root() -> PathBuf {
    data_dir().join("media")
}

fn default_media_url_prefix() -> String {
    "/media".to_string()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            url_prefix: default_media_url_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Maximum Euclidean distance between two embeddings of the same person.
    #[serde(default = "default_base_distance_threshold")]
    pub base_distance_threshold: f32,

    /// Applied to the base threshold when searching.
    #[serde(default = "default_search_distance_multiplier")]
    pub search_distance_multiplier: f32,

    /// Applied to the base threshold when assigning faces to people.
    #[serde(default = "default_person_id_distance_multiplier")]
    pub person_id_distance_multiplier: f32,

    /// Most photos a search returns; 0 means no limit.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Which detected face of a query image is searched for.
    #[serde(default)]
    pub query_face: QueryFaceSelection,
}

fn default_base_distance_threshold() -> f32 {
    0.6
}

fn default_search_distance_multiplier() -> f32 {
    0.92
}

fn default_person_id_distance_multiplier() -> f32 {
    0.9
}

fn default_max_results() -> usize {
    100
}

impl MatchingConfig {
    /// Effective cut-off used by search.
    pub fn search_threshold(&self) -> f32 {
        self.base_distance_threshold * self.search_distance_multiplier
    }

    /// Effective cut-off used when clustering faces into people.
    pub fn person_threshold(&self) -> f32 {
        self.base_distance_threshold * self.person_id_distance_multiplier
    }

    /// Unset multipliers mean "no tightening"; the rest are clamped to (0, 1].
    pub fn normalize(&mut self) {
        self.search_distance_multiplier = normalize_multiplier(self.search_distance_multiplier);
        self.person_id_distance_multiplier =
            normalize_multiplier(self.person_id_distance_multiplier);
    }
}

fn normalize_multiplier(value: f32) -> f32 {
    if value == 0.0 || !value.is_finite() {
        return 1.0;
    }
    value.clamp(0.01, 1.0)
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            base_distance_threshold: default_base_distance_threshold(),
            search_distance_multiplier: default_search_distance_multiplier(),
            person_id_distance_multiplier: default_person_id_distance_multiplier(),
            max_results: default_max_results(),
            query_face: QueryFaceSelection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Collection that is ingested on startup.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Labels applied to every photo ingested from `path`.
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default = "default_auto_ingest_on_startup")]
    pub auto_ingest_on_startup: bool,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Daemon rescans the dataset this often (0 disables periodic rescans).
    #[serde(default)]
    pub rescan_interval_secs: u64,
}

fn default_auto_ingest_on_startup() -> bool {
    true
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "gif", "webp"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: None,
            labels: Vec::new(),
            auto_ingest_on_startup: default_auto_ingest_on_startup(),
            image_extensions: default_image_extensions(),
            rescan_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Where ONNX models are cached; defaults to the local data directory.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_intra_threads() -> usize {
    4
}

fn default_confidence_threshold() -> f32 {
    0.7
}

impl DetectorConfig {
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("facefind")
                .join("models")
        })
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            intra_threads: default_intra_threads(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facefind")
}

fn default_db_path() -> PathBuf {
    data_dir().join("facefind.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            media: MediaConfig::default(),
            matching: MatchingConfig::default(),
            dataset: DatasetConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEFIND_CONFIG` or the default location, writing a default
    /// config file the first time.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("FACEFIND_CONFIG") {
            return Self::load_from(Path::new(&path));
        }

        let config_path = Self::config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.matching.normalize();
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facefind")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
