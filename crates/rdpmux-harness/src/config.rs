//! Optional TOML-backed defaults for the harness binary.
//!
//! The library crates themselves take no configuration beyond `init`'s and
//! `connect`'s arguments; this config only feeds the example harness that
//! drives them end to end, the same way `cosmic-rdp-server::config` feeds
//! that binary's `main.rs` rather than anything in the RDP protocol stack.

use serde::Deserialize;

/// Harness defaults, overridable by the equivalent CLI flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Synthetic framebuffer geometry to announce at startup.
    pub surface: SurfaceConfig,

    /// Simulated guest-activity cadence.
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of synthetic `display_update`/`display_refresh` ticks to run.
    pub ticks: u32,

    /// Delay between ticks, in milliseconds (approximates a refresh cadence).
    pub tick_interval_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            surface: SurfaceConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self { width: 1920, height: 1080 }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { ticks: 10, tick_interval_ms: 33 }
    }
}

impl HarnessConfig {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits (`#[serde(default)]` per field group).
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_hardcoded_harness_values() {
        let config = HarnessConfig::default();
        assert_eq!(config.surface.width, 1920);
        assert_eq!(config.surface.height, 1080);
        assert_eq!(config.simulation.ticks, 10);
        assert_eq!(config.simulation.tick_interval_ms, 33);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: HarnessConfig = toml::from_str("[surface]\nwidth = 640\n").unwrap();
        assert_eq!(config.surface.width, 640);
        assert_eq!(config.surface.height, 1080);
        assert_eq!(config.simulation.ticks, 10);
    }
}
