//! Configuration management for the PDFium worker
//!
//! Every field has a default; `PDFIUM_WORKER_*` environment variables
//! override them. The binary loads a `.env` file first.

use std::env;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

pub use crate::cache::CacheConfig;
use crate::pdfium::MAX_TOTAL_MEMORY;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Ceiling on tracked native heap bytes
    pub max_total_memory: usize,
    /// Keep allocation records with capture stacks in stats
    pub verbose_diagnostics: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_total_memory: MAX_TOTAL_MEMORY,
            verbose_diagnostics: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Busy time after which the runner yields to pick up new messages
    pub yield_budget_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { yield_budget_ms: 8 }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ttl) = parse(&lookup, "PDFIUM_WORKER_PAGE_TTL_MS")? {
            config.cache.page_ttl_ms = ttl;
        }
        if let Some(max) = parse(&lookup, "PDFIUM_WORKER_MAX_PAGES_PER_DOCUMENT")? {
            config.cache.max_pages_per_document = max;
        }
        if let Some(max) = parse(&lookup, "PDFIUM_WORKER_MAX_TOTAL_MEMORY")? {
            config.memory.max_total_memory = max;
        }
        if let Some(verbose) = parse(&lookup, "PDFIUM_WORKER_VERBOSE_DIAGNOSTICS")? {
            config.memory.verbose_diagnostics = verbose;
        }
        if let Some(budget) = parse(&lookup, "PDFIUM_WORKER_YIELD_BUDGET_MS")? {
            config.runner.yield_budget_ms = budget;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
