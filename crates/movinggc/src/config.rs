use std::env;
use std::path::Path;
use std::str::FromStr;

use extent_index::DEFAULT_KEYBUF_CAPACITY;
use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};

/// Tuning for the moving collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Passes run only while enabled. Can be flipped at runtime.
    pub enabled: bool,
    /// Upper bound on relocations in flight at once.
    pub max_in_flight: usize,
    /// Keys buffered per scan refill.
    pub keybuf_capacity: usize,
    /// Pages the copy buffer pool may hand out at once.
    pub buffer_pages: usize,
    /// Overrides the per-device selection limit, which otherwise equals the
    /// device's moving-GC reserve bucket count.
    pub heap_capacity: Option<usize>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: 64,
            keybuf_capacity: DEFAULT_KEYBUF_CAPACITY,
            buffer_pages: 16 * 1024,
            heap_capacity: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: String) -> GcResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| GcError::Config(format!("{name}: cannot parse {raw:?}")))
}

impl GcConfig {
    /// Defaults overridden by `MOVINGGC_*` environment variables.
    pub fn from_env() -> GcResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GcResult<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup("MOVINGGC_ENABLED") {
            config.enabled = parse_var("MOVINGGC_ENABLED", raw)?;
        }
        if let Some(raw) = lookup("MOVINGGC_MAX_IN_FLIGHT") {
            config.max_in_flight = parse_var("MOVINGGC_MAX_IN_FLIGHT", raw)?;
        }
        if let Some(raw) = lookup("MOVINGGC_KEYBUF_CAPACITY") {
            config.keybuf_capacity = parse_var("MOVINGGC_KEYBUF_CAPACITY", raw)?;
        }
        if let Some(raw) = lookup("MOVINGGC_BUFFER_PAGES") {
            config.buffer_pages = parse_var("MOVINGGC_BUFFER_PAGES", raw)?;
        }
        if let Some(raw) = lookup("MOVINGGC_HEAP_CAPACITY") {
            config.heap_capacity = Some(parse_var("MOVINGGC_HEAP_CAPACITY", raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> GcResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> GcResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> GcResult<()> {
        if self.max_in_flight == 0 {
            return Err(GcError::Config("max_in_flight must be at least 1".into()));
        }
        if self.buffer_pages == 0 {
            return Err(GcError::Config("buffer_pages must be at least 1".into()));
        }
        // A full keybuf of claimed keys would stall admission.
        if self.keybuf_capacity <= self.max_in_flight {
            return Err(GcError::Config(format!(
                "keybuf_capacity ({}) must exceed max_in_flight ({})",
                self.keybuf_capacity, self.max_in_flight
            )));
        }
        Ok(())
    }
}
