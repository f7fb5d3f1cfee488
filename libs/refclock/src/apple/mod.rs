// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! macOS vblank sources.

pub mod display_link;

pub use display_link::DisplayLinkBackend;
