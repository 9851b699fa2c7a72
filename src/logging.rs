// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset. Kept at `warn` so the program
/// status lines stay readable.
pub const DEFAULT_DIRECTIVE: &str = "warn";

/// Installs the `fmt` subscriber filtered by `RUST_LOG`.
pub fn init() {
    init_with_default(DEFAULT_DIRECTIVE);
}

/// Installs the `fmt` subscriber, falling back to `directive` when `RUST_LOG`
/// is unset or invalid. Calling it again once a subscriber is set does nothing.
pub fn init_with_default(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
