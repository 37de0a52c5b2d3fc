//! Layered configuration for toolsmith.
//!
//! 1. Compiled defaults ([`ToolsmithSettings::default()`])
//! 2. `~/.toolsmith/settings.json` (or an explicit path), deep-merged
//! 3. `TOOLSMITH_*` environment variables
//!
//! The process-wide copy lives behind [`get_settings`] and can be swapped
//! with [`init_settings`] once the binary knows which file to read.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, resolve_db_path, settings_path, toolsmith_home,
};
pub use types::*;

use std::sync::Arc;

use parking_lot::RwLock;

static SETTINGS: RwLock<Option<Arc<ToolsmithSettings>>> = RwLock::new(None);

/// Cached settings, loading from the default path on first use.
/// Falls back to compiled defaults when loading fails.
pub fn get_settings() -> Arc<ToolsmithSettings> {
    if let Some(s) = SETTINGS.read().as_ref() {
        return Arc::clone(s);
    }

    let mut guard = SETTINGS.write();
    if let Some(s) = guard.as_ref() {
        return Arc::clone(s);
    }
    let settings = Arc::new(load_settings().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load settings, using defaults");
        ToolsmithSettings::default()
    }));
    *guard = Some(Arc::clone(&settings));
    settings
}

pub fn init_settings(settings: ToolsmithSettings) -> Arc<ToolsmithSettings> {
    let settings = Arc::new(settings);
    *SETTINGS.write() = Some(Arc::clone(&settings));
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    static SETTINGS_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn init_replaces_cached_value_without_touching_snapshots() {
        let _lock = SETTINGS_MUTEX.lock();
        let mut first = ToolsmithSettings::default();
        first.server.port = 1111;
        init_settings(first);
        let snapshot = get_settings();

        let mut second = ToolsmithSettings::default();
        second.server.port = 2222;
        init_settings(second);

        assert_eq!(snapshot.server.port, 1111);
        assert_eq!(get_settings().server.port, 2222);
    }
}
