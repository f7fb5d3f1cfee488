// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result};

use refclock::ClockConfig;

/// Print the effective configuration.
pub fn run(config: &ClockConfig) -> Result<()> {
    let toml = config
        .to_toml_string()
        .context("Failed to serialize configuration")?;
    print!("{}", toml);
    Ok(())
}
