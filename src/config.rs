use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::apparent::DEFAULT_SEGMENTS_PER_QUADRANT;

/// Objective strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Minimize movement away from the previous cycle's applied values.
    MoveTowardsTarget,
    /// Split requested totals evenly across participating converters.
    KeepAllNearEqual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PowerConfig {
    pub strategy: StrategyKind,
    /// Wall-clock budget for one solve, in milliseconds. On exhaustion the
    /// best assignment found so far is returned instead of blocking the
    /// control cycle.
    pub solve_budget_ms: u64,
    /// Circle segments per quadrant for apparent-power polygons.
    pub circle_segments_per_quadrant: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::MoveTowardsTarget,
            solve_budget_ms: 500,
            circle_segments_per_quadrant: DEFAULT_SEGMENTS_PER_QUADRANT,
        }
    }
}

impl PowerConfig {
    /// Loads `config/power.toml` merged with `POWER__`-prefixed environment
    /// variables; missing sources fall back to the defaults.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/power.toml"))
            .merge(Env::prefixed("POWER__").split("__"));
        Ok(figment.extract()?)
    }
}
