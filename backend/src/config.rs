use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_PATH_VAR: &str = "LESION_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Tract,
    Torch,
}

impl FromStr for ModelBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tract" | "onnx" => Ok(ModelBackend::Tract),
            "torch" | "torchscript" => Ok(ModelBackend::Torch),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origin: String,
    pub upload_dir: PathBuf,
    pub keep_uploads: bool,
    pub max_upload_bytes: usize,
    pub models: ModelPaths,
    pub image_size: u32,
    pub mask_threshold: f32,
    pub visualization: VisualizationSettings,
    pub redact_internal_errors: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub backend: ModelBackend,
    pub segmentation: PathBuf,
    pub classification: PathBuf,
    pub metadata: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisualizationSettings {
    pub panel_size: u32,
    pub highlight_color: [u8; 3],
    pub font_path: Option<PathBuf>,
    pub title_scale: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origin: "https://skin-lesion-classifier.vercel.app".to_string(),
            upload_dir: PathBuf::from("uploads"),
            keep_uploads: true,
            max_upload_bytes: 20 * 1024 * 1024,
            models: ModelPaths::default(),
            image_size: 224,
            mask_threshold: 0.5,
            visualization: VisualizationSettings::default(),
            redact_internal_errors: false,
        }
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            backend: ModelBackend::Tract,
            segmentation: PathBuf::from("models/segmentation_model_final.onnx"),
            classification: PathBuf::from("models/classification_model_final.onnx"),
            metadata: PathBuf::from("models/metadata_model.json"),
        }
    }
}

impl Default for VisualizationSettings {
    fn default() -> Self {
        Self {
            panel_size: 448,
            highlight_color: [255, 0, 0],
            font_path: None,
            title_scale: 24.0,
        }
    }
}

impl AppConfig {
    /// Defaults, then the YAML file named by `LESION_CONFIG`, then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_value("PORT", port)?;
        }
        if let Some(origin) = lookup("ALLOWED_ORIGIN") {
            self.allowed_origin = origin;
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(keep) = lookup("KEEP_UPLOADS") {
            self.keep_uploads = parse_flag("KEEP_UPLOADS", keep)?;
        }
        if let Some(limit) = lookup("MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_value("MAX_UPLOAD_BYTES", limit)?;
        }
        if let Some(backend) = lookup("MODEL_BACKEND") {
            self.models.backend = parse_value("MODEL_BACKEND", backend)?;
        }
        if let Some(path) = lookup("SEGMENTATION_MODEL_PATH") {
            self.models.segmentation = PathBuf::from(path);
        }
        if let Some(path) = lookup("CLASSIFICATION_MODEL_PATH") {
            self.models.classification = PathBuf::from(path);
        }
        if let Some(path) = lookup("METADATA_MODEL_PATH") {
            self.models.metadata = PathBuf::from(path);
        }
        if let Some(threshold) = lookup("MASK_THRESHOLD") {
            self.mask_threshold = parse_value("MASK_THRESHOLD", threshold)?;
        }
        if let Some(path) = lookup("FONT_PATH") {
            self.visualization.font_path = Some(PathBuf::from(path));
        }
        if let Some(redact) = lookup("REDACT_INTERNAL_ERRORS") {
            self.redact_internal_errors = parse_flag("REDACT_INTERNAL_ERRORS", redact)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.mask_threshold > 0.0 && self.mask_threshold < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "mask_threshold",
                value: self.mask_threshold.to_string(),
            });
        }
        let origin_ok = (self.allowed_origin.starts_with("http://")
            || self.allowed_origin.starts_with("https://"))
            && !self.allowed_origin.contains('*');
        if !origin_ok {
            return Err(ConfigError::InvalidValue {
                key: "allowed_origin",
                value: self.allowed_origin.clone(),
            });
        }
        if self.image_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "image_size",
                value: "0".to_string(),
            });
        }
        if self.visualization.panel_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "visualization.panel_size",
                value: "0".to_string(),
            });
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_upload_bytes",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}
