// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod config;
pub mod measure;
pub mod probe;

use std::path::Path;

use anyhow::{Context, Result};
use refclock::{BackendPreference, ClockConfig};

/// Config from `path` (or defaults), with the command-line backend applied on top.
pub fn load_config(path: Option<&Path>, backend: Option<BackendPreference>) -> Result<ClockConfig> {
    let mut config = match path {
        Some(path) => ClockConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClockConfig::default(),
    };
    if let Some(backend) = backend {
        config.backend = backend;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
