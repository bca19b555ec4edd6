//! Configuration module for cubesync.
//!
//! Handles layout expansion limits, computed column policy, the metadata
//! store location and reload behaviour.

mod settings;

pub use settings::{
    expand_env_vars, ComputedColumnSettings, LayoutSettings, ReloadSettings, Settings,
    SettingsError, StoreSettings,
};
