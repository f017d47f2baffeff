// Pricing table and cost computation for AI exchanges
//
// No rates live in code. A bundled TOML table compiles in as data and user
// override files merge over it at startup; the merged table is immutable
// for the rest of the process. A missing (provider, model) entry yields a
// null cost, never a synthesized zero.

use crate::events::{CostRecord, TokenUsage};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Default table compiled in as data (not code constants); see
/// `assets/pricing.toml` for the file format.
const BUNDLED_PRICING: &str = include_str!("../assets/pricing.toml");

/// Rates for one (provider, model) pair, per 1,000 tokens.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub provider: String,
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(default)]
    pub cache_read_per_1k: Option<f64>,
    pub currency: String,
    #[serde(default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(default, rename = "model")]
    models: Vec<ModelPricing>,
}

/// Immutable (provider, model) -> rates map, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<(String, String), ModelPricing>,
}

impl PricingTable {
    /// Load the bundled table and merge user override files over it.
    ///
    /// Later paths win per key. Missing files are skipped silently; present
    /// but malformed files are a startup error so a typo never silently
    /// reverts pricing to the bundled figures.
    pub fn load(extra_paths: &[PathBuf]) -> Result<Self> {
        let mut table = Self::default();
        table
            .merge_str(BUNDLED_PRICING)
            .context("bundled pricing table is malformed")?;

        for path in default_override_paths().iter().chain(extra_paths.iter()) {
            if !path.exists() {
                continue;
            }
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading pricing file {}", path.display()))?;
            table
                .merge_str(&contents)
                .with_context(|| format!("parsing pricing file {}", path.display()))?;
            tracing::debug!("Merged pricing overrides from {}", path.display());
        }

        Ok(table)
    }

    /// Parse one TOML document and merge its entries over the current map.
    fn merge_str(&mut self, toml_text: &str) -> Result<()> {
        let file: PricingFile = toml::from_str(toml_text)?;
        for entry in file.models {
            self.entries
                .insert((entry.provider.clone(), entry.model.clone()), entry);
        }
        Ok(())
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        self.entries
            .get(&(provider.to_string(), model.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the cost record for one exchange, or None when the table has
    /// no entry for (provider, model).
    pub fn cost(&self, provider: &str, model: &str, usage: &TokenUsage) -> Option<CostRecord> {
        let pricing = self.get(provider, model)?;

        let input = round_cost(usage.input_tokens as f64 / 1000.0 * pricing.input_per_1k);
        let output = round_cost(usage.output_tokens as f64 / 1000.0 * pricing.output_per_1k);

        Some(CostRecord {
            input,
            output,
            total: round_cost(input + output),
            currency: pricing.currency.clone(),
            last_updated: pricing.last_updated.clone(),
        })
    }
}

/// User-level override locations checked on every run.
fn default_override_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("agent-trace").join("pricing.toml"));
    }
    paths
}


// Rounds away binary-float noise without flattening sub-cent figures:
// a 5-token completion at $0.015/1k is a real $0.000075.
fn round_cost(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}
