//! Engine configuration persistence.
//!
//! The audio settings snapshot lives in the user config dir and seeds the
//! next start; CLI flags override individual fields.

use std::path::PathBuf;

use crate::error::Result;
use crate::graph::AudioSettings;

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("synthpod")
        .join("config.json")
}

/// Load the stored settings; any failure falls back to defaults.
pub fn load_settings() -> AudioSettings {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("{}: unreadable config ({err}), using defaults", path.display());
                AudioSettings::default()
            }
        },
        Err(_) => AudioSettings::default(),
    }
}

/// Persist the settings for the next start.
pub fn save_settings(settings: &AudioSettings) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(settings).unwrap_or_default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_json_roundtrip() {
        let settings = AudioSettings {
            sample_rate: 44100,
            period_size: 256,
            num_periods: 3,
            cpus_used: 2,
            cpus_available: 8,
        };
        let text = serde_json::to_string(&settings).unwrap();
        let back: AudioSettings = serde_json::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
