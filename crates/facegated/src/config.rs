use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use facegate_core::settings::{DEFAULT_COLLECTION, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_MATCH_THRESHOLD};
use facegate_core::{CoreSettings, Deadlines};
use facegate_vision::models::DEFAULT_MODEL;
use facegate_vision::{Device, ModelSpec};
use serde::Deserialize;

const SYSTEM_CONFIG_PATH: &str = "/etc/facegate/facegate.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Sqlite,
    Memory,
}

impl FromStr for IndexBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(IndexBackend::Sqlite),
            "memory" => Ok(IndexBackend::Memory),
            other => Err(format!("unknown index backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration: defaults, then the TOML file, then `FACEGATE_*`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub embedding_dimension: usize,
    /// Maximum cosine distance for a match, inclusive.
    pub match_threshold: f32,
    pub allow_duplicate_faces: bool,
    /// `cpu`, `cuda` or `cuda:<index>`.
    pub device: String,
    pub model: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    pub collection: String,
    pub index_backend: IndexBackend,
    pub bus: BusKind,
    pub token_ttl_minutes: i64,
    pub detect_timeout_ms: u64,
    pub extract_timeout_ms: u64,
    pub index_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub store_timeout_ms: u64,
    /// Account created on first start if no user of that name exists.
    pub admin_username: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            allow_duplicate_faces: false,
            device: "cpu".to_string(),
            model: DEFAULT_MODEL.to_string(),
            model_dir: PathBuf::from("/usr/share/facegate/models"),
            db_path: default_data_dir().join("facegate.db"),
            collection: DEFAULT_COLLECTION.to_string(),
            index_backend: IndexBackend::Sqlite,
            bus: BusKind::System,
            token_ttl_minutes: 30,
            detect_timeout_ms: 5000,
            extract_timeout_ms: 5000,
            index_timeout_ms: 3000,
            load_timeout_ms: 30000,
            store_timeout_ms: 3000,
            admin_username: "admin".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

impl Config {
    /// Load and validate the process configuration.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("FACEGATE_CONFIG").ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(SYSTEM_CONFIG_PATH).exists() => Self::from_file(Path::new(SYSTEM_CONFIG_PATH))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `FACEGATE_*` variables. Unparsable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        env.set("FACEGATE_EMBEDDING_DIMENSION", &mut self.embedding_dimension);
        env.set("FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        env.set("FACEGATE_ALLOW_DUPLICATE_FACES", &mut self.allow_duplicate_faces);
        env.set("FACEGATE_DEVICE", &mut self.device);
        env.set("FACEGATE_MODEL", &mut self.model);
        env.set("FACEGATE_MODEL_DIR", &mut self.model_dir);
        env.set("FACEGATE_DB_PATH", &mut self.db_path);
        env.set("FACEGATE_COLLECTION", &mut self.collection);
        env.set("FACEGATE_INDEX_BACKEND", &mut self.index_backend);
        env.set("FACEGATE_BUS", &mut self.bus);
        env.set("FACEGATE_TOKEN_TTL_MINUTES", &mut self.token_ttl_minutes);
        env.set("FACEGATE_DETECT_TIMEOUT_MS", &mut self.detect_timeout_ms);
        env.set("FACEGATE_EXTRACT_TIMEOUT_MS", &mut self.extract_timeout_ms);
        env.set("FACEGATE_INDEX_TIMEOUT_MS", &mut self.index_timeout_ms);
        env.set("FACEGATE_LOAD_TIMEOUT_MS", &mut self.load_timeout_ms);
        env.set("FACEGATE_STORE_TIMEOUT_MS", &mut self.store_timeout_ms);
        env.set("FACEGATE_ADMIN_USERNAME", &mut self.admin_username);
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            bail!("embedding_dimension must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.match_threshold) {
            bail!(
                "match_threshold {} is outside [0, 2] (it is a maximum cosine distance)",
                self.match_threshold
            );
        }
        if self.collection.is_empty() {
            bail!("collection must not be empty");
        }
        if self.token_ttl_minutes <= 0 {
            bail!("token_ttl_minutes must be positive");
        }
        let spec = ModelSpec::lookup(&self.model)?;
        if spec.embedding_dimension != self.embedding_dimension {
            bail!(
                "model {} produces {}-dim embeddings but embedding_dimension is {}",
                spec.name,
                spec.embedding_dimension,
                self.embedding_dimension
            );
        }
        self.device()?;
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.device.parse::<Device>()?)
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            decode: Duration::from_millis(self.detect_timeout_ms),
            detect: Duration::from_millis(self.detect_timeout_ms),
            extract: Duration::from_millis(self.extract_timeout_ms),
            index: Duration::from_millis(self.index_timeout_ms),
            load: Duration::from_millis(self.load_timeout_ms),
            store: Duration::from_millis(self.store_timeout_ms),
        }
    }

    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            collection: self.collection.clone(),
            embedding_dimension: self.embedding_dimension,
            match_threshold: self.match_threshold,
            allow_duplicate_faces: self.allow_duplicate_faces,
            deadlines: self.deadlines(),
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_ttl_minutes)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T>(&self, key: &str, slot: &mut T)
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring unparsable environment override"),
        }
    }
}
