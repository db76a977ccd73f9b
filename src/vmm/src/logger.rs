// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use log::{LevelFilter, SetLoggerError};

/// Maps the numeric levels used by the C API to a filter.
pub fn level_filter(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs `env_logger` as the process logger. `RUST_LOG` still refines the
/// filter per module.
pub fn init(level: u32) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level_filter(level))
        .parse_default_env()
        .try_init()
}
