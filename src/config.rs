//! Shim configuration
//!
//! Defaults can be overridden by a JSON file named in `FBDEV_SHIM_CONFIG`,
//! and individual keys by `FBDEV_SHIM_*` environment variables. The
//! environment always wins over the file.

use crate::display::{DisplayBackend, PixelFormat};
use crate::memory::MemoryBackend;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "FBDEV_SHIM_CONFIG";
pub const LOG_ENV: &str = "FBDEV_SHIM_LOG";

/// Which display stack backs the framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    DirectFb,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "directfb" => Ok(BackendKind::DirectFb),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "directfb") {
            BackendKind::DirectFb
        } else {
            BackendKind::Memory
        }
    }
}

/// Pixel format names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatName {
    Rgb16,
    Rgb24,
    Rgb32,
}

impl FormatName {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgb16" | "rgb565" => Ok(FormatName::Rgb16),
            "rgb24" => Ok(FormatName::Rgb24),
            "rgb32" | "argb" => Ok(FormatName::Rgb32),
            other => Err(Error::Config(format!("unknown pixel format '{}'", other))),
        }
    }
}

impl From<FormatName> for PixelFormat {
    fn from(name: FormatName) -> Self {
        match name {
            FormatName::Rgb16 => PixelFormat::Rgb16,
            FormatName::Rgb24 => PixelFormat::Rgb24,
            FormatName::Rgb32 => PixelFormat::Rgb32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    /// Paths containing this string are treated as framebuffer devices
    pub device_prefix: String,
    /// Inert device opened to back the returned descriptor
    pub discard_path: String,
    /// Memory backend geometry
    pub width: u32,
    pub height: u32,
    pub format: FormatName,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            device_prefix: "/dev/fb".to_string(),
            discard_path: "/dev/null".to_string(),
            width: 640,
            height: 480,
            format: FormatName::Rgb32,
        }
    }
}

impl Config {
    /// Load from the optional config file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded shim config from {:?}", path);
        Ok(config)
    }

    /// Apply `FBDEV_SHIM_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FBDEV_SHIM_BACKEND") {
            self.backend = BackendKind::parse(&v)?;
        }
        if let Some(v) = lookup("FBDEV_SHIM_DEVICE_PREFIX") {
            self.device_prefix = v;
        }
        if let Some(v) = lookup("FBDEV_SHIM_DISCARD_PATH") {
            self.discard_path = v;
        }
        if let Some(v) = lookup("FBDEV_SHIM_WIDTH") {
            self.width = parse_dimension("FBDEV_SHIM_WIDTH", &v)?;
        }
        if let Some(v) = lookup("FBDEV_SHIM_HEIGHT") {
            self.height = parse_dimension("FBDEV_SHIM_HEIGHT", &v)?;
        }
        if let Some(v) = lookup("FBDEV_SHIM_FORMAT") {
            self.format = FormatName::parse(&v)?;
        }
        Ok(())
    }

    /// Whether `path` names a framebuffer device
    pub fn is_framebuffer_path(&self, path: &str) -> bool {
        !self.device_prefix.is_empty() && path.contains(self.device_prefix.as_str())
    }

    /// Instantiate the configured display backend
    pub fn create_backend(&self) -> Result<Box<dyn DisplayBackend>> {
        match self.backend {
            BackendKind::Memory => Ok(Box::new(MemoryBackend::new(
                self.width,
                self.height,
                self.format.into(),
            ))),
            #[cfg(feature = "directfb")]
            BackendKind::DirectFb => Ok(Box::new(crate::directfb::DirectFbBackend::new())),
            #[cfg(not(feature = "directfb"))]
            BackendKind::DirectFb => Err(Error::UnknownBackend(
                "directfb (built without the `directfb` feature)".to_string(),
            )),
        }
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::Config(format!("{} must be a positive integer, got '{}'", key, value))),
    }
}
