//! # cowork-settings
//!
//! Layered configuration for cowork.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`CoworkSettings::default()`]
//! 2. **User file** - `~/.cowork/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `COWORK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<CoworkSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// Loads on first call and caches. Falls back to compiled defaults if loading
/// fails.
pub fn get_settings() -> &'static CoworkSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            CoworkSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the value back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CoworkSettings) -> std::result::Result<(), CoworkSettings> {
    SETTINGS.set(settings)
}
