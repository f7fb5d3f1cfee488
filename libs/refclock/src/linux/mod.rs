// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Linux vblank sources.

pub mod drm;

pub use drm::{DrmVblankBackend, DrmVblankCounter};
