//! # herald-settings
//!
//! Layered configuration for the herald dispatch service.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`HeraldSettings::default()`])
//! 2. **Settings file** (`~/.herald/settings.json` or an explicit path, deep-merged)
//! 3. **Environment variables** (`HERALD_*` overrides)
//!
//! The loaded settings are passed explicitly to the components that need them.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, herald_home, load_settings, load_settings_from_path,
    load_with_env, settings_path,
};
pub use types::*;
