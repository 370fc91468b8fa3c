// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<RowfoldConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

/// Process-wide config, loaded lazily on first use. Every later `init_*`
/// call observes the same instance.
pub fn config() -> Result<&'static RowfoldConfig> {
    init_from_env_or_default()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static RowfoldConfig> {
    load_once(|| RowfoldConfig::load_from_file(path.as_ref()))
}

pub fn init_from_env_or_default() -> Result<&'static RowfoldConfig> {
    load_once(|| RowfoldConfig::load_from_file(&locate_config_file()?))
}

fn load_once(load: impl FnOnce() -> Result<RowfoldConfig>) -> Result<&'static RowfoldConfig> {
    match CONFIG.get() {
        Some(cfg) => Ok(cfg),
        None => {
            let cfg = load()?;
            Ok(CONFIG.get_or_init(|| cfg))
        }
    }
}

fn locate_config_file() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("ROWFOLD_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    let fallback = PathBuf::from("rowfold.toml");
    if fallback.exists() {
        return Ok(fallback);
    }
    Err(anyhow!(
        "missing config file: set $ROWFOLD_CONFIG or create ./rowfold.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct RowfoldConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "rowfold=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub merge: MergeConfig,
}

impl RowfoldConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: RowfoldConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for RowfoldConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            merge: MergeConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,
    #[serde(default = "default_merge_buffer_count")]
    pub buffer_count: usize,
    #[serde(default = "default_merge_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Default per-query disk quota for spill runs. 0 disables spilling
    /// unless the query carries its own quota.
    #[serde(default = "default_max_spill_bytes")]
    pub max_spill_bytes: u64,
    #[serde(default)]
    pub spill_dir: Option<String>,
    #[serde(default = "default_max_dictionary_bytes")]
    pub max_dictionary_bytes: u64,
}

fn default_exec_threads() -> usize {
    0 // 0 means use CPU cores
}

fn default_merge_buffer_count() -> usize {
    4
}

fn default_merge_buffer_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_query_timeout_ms() -> u64 {
    300_000
}

fn default_max_spill_bytes() -> u64 {
    0
}

fn default_max_dictionary_bytes() -> u64 {
    100_000_000
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            buffer_count: default_merge_buffer_count(),
            buffer_bytes: default_merge_buffer_bytes(),
            default_timeout_ms: default_query_timeout_ms(),
            max_spill_bytes: default_max_spill_bytes(),
            spill_dir: None,
            max_dictionary_bytes: default_max_dictionary_bytes(),
        }
    }
}

impl MergeConfig {
    /// Get the actual number of executor threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            self.exec_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn spill_dir_path(&self) -> PathBuf {
        match &self.spill_dir {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join("rowfold_spill"),
        }
    }
}

pub(crate) fn exec_threads() -> usize {
    config()
        .ok()
        .map(|c| c.merge.actual_exec_threads())
        .unwrap_or_else(|| MergeConfig::default().actual_exec_threads())
}

pub(crate) fn merge_buffer_count() -> usize {
    config()
        .ok()
        .map(|c| c.merge.buffer_count)
        .unwrap_or_else(default_merge_buffer_count)
}

pub(crate) fn merge_buffer_bytes() -> usize {
    config()
        .ok()
        .map(|c| c.merge.buffer_bytes)
        .unwrap_or_else(default_merge_buffer_bytes)
}

pub(crate) fn default_timeout_ms() -> u64 {
    config()
        .ok()
        .map(|c| c.merge.default_timeout_ms)
        .unwrap_or_else(default_query_timeout_ms)
}

pub(crate) fn max_spill_bytes() -> u64 {
    config()
        .ok()
        .map(|c| c.merge.max_spill_bytes)
        .unwrap_or_else(default_max_spill_bytes)
}

pub(crate) fn spill_dir() -> std::path::PathBuf {
    config()
        .ok()
        .map(|c| c.merge.spill_dir_path())
        .unwrap_or_else(|| MergeConfig::default().spill_dir_path())
}

pub(crate) fn max_dictionary_bytes() -> u64 {
    config()
        .ok()
        .map(|c| c.merge.max_dictionary_bytes)
        .unwrap_or_else(default_max_dictionary_bytes)
}
