//! Persisted engine settings (JSON).
//!
//! Missing fields take their defaults so older files keep loading.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::budget;
use crate::core::frame_cache::CachePolicy;
use crate::core::player::LoopMode;
use crate::core::timer_hub::TickStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Playback
    pub fps_base: f64,
    pub loop_mode: LoopMode,
    pub lockstep: bool, // Every-frame mode

    // Cache & Memory
    pub cache_budget_mb: u64,          // 0 = derive from system memory
    pub cache_memory_percent: f32,     // 25-95% of available (default 75%)
    pub reserve_system_memory_gb: f32, // Reserve for system (default 2.0 GB)
    pub cache_policy: CachePolicy,

    // Timer
    pub tick_strategy: TickStrategy,
    pub tick_resolution_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fps_base: 24.0,
            loop_mode: LoopMode::Repeat,
            lockstep: false,
            cache_budget_mb: 0,
            cache_memory_percent: 75.0,
            reserve_system_memory_gb: 2.0,
            cache_policy: CachePolicy::LruPlayback,
            tick_strategy: TickStrategy::BusyWait,
            tick_resolution_ms: 5,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load, falling back to defaults when the file is missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!("{:#}, using defaults", e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Cache budget in bytes: explicit size, else a share of system memory.
    pub fn cache_budget_bytes(&self) -> usize {
        if self.cache_budget_mb > 0 {
            return (self.cache_budget_mb as usize).saturating_mul(1024 * 1024);
        }
        let fraction = f64::from(self.cache_memory_percent.clamp(25.0, 95.0)) / 100.0;
        budget::from_system(fraction, f64::from(self.reserve_system_memory_gb))
    }

    pub fn tick_resolution(&self) -> Duration {
        Duration::from_millis(self.tick_resolution_ms.max(1))
    }
}
