// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Environment-derived runtime configuration.
//!
//! `VESPER_MODULE_PATH` is a colon-separated search path handed to the
//! external module loader through the globals table. When
//! `VESPER_IGNORE_SYSTEM_PATH` is present (any value), the built-in
//! default directories are omitted.

use std::path::PathBuf;

/// Name of the module search path variable.
pub const MODULE_PATH_VAR: &str = "VESPER_MODULE_PATH";

/// Name of the system-path suppression variable.
pub const IGNORE_SYSTEM_PATH_VAR: &str = "VESPER_IGNORE_SYSTEM_PATH";

/// Built-in search directories, appended unless suppressed.
const SYSTEM_PATH: &[&str] = &["/usr/local/share/vesper", "/usr/share/vesper"];

/// Resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Module search path, in lookup order.
    pub module_path: Vec<PathBuf>,
    /// Whether the built-in defaults were suppressed.
    pub ignore_system_path: bool,
}

impl Config {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let ignore_system_path = std::env::var_os(IGNORE_SYSTEM_PATH_VAR).is_some();
        let mut module_path = Vec::new();
        if let Some(path) = std::env::var_os(MODULE_PATH_VAR) {
            for dir in std::env::split_paths(&path) {
                if !dir.as_os_str().is_empty() {
                    module_path.push(dir);
                }
            }
        }
        if !ignore_system_path {
            module_path.extend(SYSTEM_PATH.iter().map(PathBuf::from));
        }
        Self {
            module_path,
            ignore_system_path,
        }
    }
}

#[cfg(test)]
mod config_test {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn system_path_present_by_default() {
        // Only checks construction; the environment of the test runner
        // may or may not define the variables.
        let config = Config::from_env();
        if !config.ignore_system_path {
            assert!(
                config
                    .module_path
                    .iter()
                    .any(|p| p == &PathBuf::from("/usr/share/vesper"))
            );
        }
    }
}
