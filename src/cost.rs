use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ModelPricingOverride, PricingConfig};
use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};

pub const COST_CACHE_VERSION: &str = "1";
const COST_CACHE_KEY: &str = "session_cost";
const MAX_TRACKED_SESSIONS: usize = 20;

const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
const CACHE_READ_MULTIPLIER: f64 = 0.1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const OPUS: Self = Self::new(15.0, 75.0);
    const OPUS_4_5: Self = Self::new(5.0, 25.0);
    const SONNET: Self = Self::new(3.0, 15.0);
    const HAIKU: Self = Self::new(0.8, 4.0);
    const HAIKU_4_5: Self = Self::new(1.0, 5.0);

    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Override,
    Exact,
    Family,
    #[default]
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PricingResolution {
    pub pricing: ModelPricing,
    pub source: PricingSource,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenCostBreakdown {
    pub input_cost_usd: f64,
    pub cache_write_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub output_cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct CostComputation {
    pub pricing: ModelPricing,
    pub source: PricingSource,
    pub breakdown: TokenCostBreakdown,
    pub total_cost_usd: f64,
}

/// Plain input/output estimate with the built-in table.
pub fn estimate_cost(input_tokens: u64, output_tokens: u64, model_id: &str) -> f64 {
    let usage = TokenUsage {
        input_tokens,
        output_tokens,
        ..TokenUsage::default()
    };
    compute_total_cost(model_id, &usage, &PricingConfig::default()).total_cost_usd
}

pub fn compute_total_cost(model_id: &str, usage: &TokenUsage, pricing_config: &PricingConfig) -> CostComputation {
    let resolved = resolve_model_pricing(model_id, pricing_config);
    let per_token_in = resolved.pricing.input_per_million / 1_000_000.0;
    let per_token_out = resolved.pricing.output_per_million / 1_000_000.0;

    let breakdown = TokenCostBreakdown {
        input_cost_usd: usage.input_tokens as f64 * per_token_in,
        cache_write_cost_usd: usage.cache_creation_tokens as f64 * per_token_in * CACHE_WRITE_MULTIPLIER,
        cache_read_cost_usd: usage.cache_read_tokens as f64 * per_token_in * CACHE_READ_MULTIPLIER,
        output_cost_usd: usage.output_tokens as f64 * per_token_out,
    };
    let total_cost_usd = breakdown.input_cost_usd
        + breakdown.cache_write_cost_usd
        + breakdown.cache_read_cost_usd
        + breakdown.output_cost_usd;

    CostComputation {
        pricing: resolved.pricing,
        source: resolved.source,
        breakdown,
        total_cost_usd,
    }
}

/// Override by longest matching prefix, then known model prefixes, then
/// model family, then sonnet pricing.
pub fn resolve_model_pricing(model_id: &str, pricing_config: &PricingConfig) -> PricingResolution {
    let key = normalize_model_key(model_id);

    if let Some(pricing) = lookup_override(&key, &pricing_config.overrides) {
        return PricingResolution {
            pricing,
            source: PricingSource::Override,
        };
    }

    if let Some(pricing) = default_model_pricing(&key) {
        return PricingResolution {
            pricing,
            source: PricingSource::Exact,
        };
    }

    if let Some(pricing) = family_pricing(&key) {
        return PricingResolution {
            pricing,
            source: PricingSource::Family,
        };
    }

    PricingResolution {
        pricing: ModelPricing::SONNET,
        source: PricingSource::Fallback,
    }
}

fn lookup_override(
    model_key: &str,
    overrides: &BTreeMap<String, ModelPricingOverride>,
) -> Option<ModelPricing> {
    let (_, entry) = overrides
        .iter()
        .filter(|(prefix, _)| model_key.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())?;
    if !entry.input_per_million.is_finite() || entry.input_per_million < 0.0 {
        return None;
    }
    if !entry.output_per_million.is_finite() || entry.output_per_million < 0.0 {
        return None;
    }
    Some(ModelPricing::new(entry.input_per_million, entry.output_per_million))
}

pub fn normalize_model_key(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}

fn default_model_pricing(model: &str) -> Option<ModelPricing> {
    const KNOWN: &[(&str, ModelPricing)] = &[
        ("claude-opus-4-5", ModelPricing::OPUS_4_5),
        ("claude-haiku-4-5", ModelPricing::HAIKU_4_5),
        ("claude-3-5-haiku", ModelPricing::HAIKU),
        ("claude-3-5-sonnet", ModelPricing::SONNET),
    ];
    KNOWN
        .iter()
        .find(|(prefix, _)| model.starts_with(*prefix))
        .map(|(_, pricing)| *pricing)
}

fn family_pricing(model: &str) -> Option<ModelPricing> {
    if model.contains("opus") {
        Some(ModelPricing::OPUS)
    } else if model.contains("sonnet") {
        Some(ModelPricing::SONNET)
    } else if model.contains("haiku") {
        Some(ModelPricing::HAIKU)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CostStats {
    pub session: f64,
    pub today: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SessionTotal {
    id: String,
    total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CostLedger {
    session_cost: f64,
    today_cost: f64,
    total_cost: f64,
    last_reset_date: NaiveDate,
    #[serde(default)]
    sessions: Vec<SessionTotal>,
}

impl CostLedger {
    fn empty(today: NaiveDate) -> Self {
        Self {
            session_cost: 0.0,
            today_cost: 0.0,
            total_cost: 0.0,
            last_reset_date: today,
            sessions: Vec::new(),
        }
    }

    fn add(&mut self, amount: f64, today: NaiveDate) {
        if self.last_reset_date != today {
            self.today_cost = 0.0;
            self.last_reset_date = today;
        }
        self.today_cost += amount;
        self.total_cost += amount;
    }

    fn stats(&self, today: NaiveDate) -> CostStats {
        CostStats {
            session: self.session_cost,
            today: if self.last_reset_date == today {
                self.today_cost
            } else {
                0.0
            },
            total: self.total_cost,
        }
    }
}

/// Spend totals for the current session, the local calendar day and all
/// time. The day rolls over lazily on the first write of a new date.
pub struct CostAccumulator<B = FileBackend> {
    store: CacheStore<CostLedger, B>,
}

impl CostAccumulator {
    pub fn open(path: PathBuf) -> Self {
        Self::with_backend(FileBackend::new(path))
    }
}

impl<B: CacheBackend> CostAccumulator<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            store: CacheStore::new(backend, COST_CACHE_VERSION, TtlRule::Never, 1),
        }
    }

    pub fn record_cost(&self, amount: f64, now: DateTime<Utc>) -> CostStats {
        let today = local_date(now);
        if !amount.is_finite() || amount < 0.0 {
            return self.stats(now);
        }
        let ledger = self.store.update_at(COST_CACHE_KEY, now, |current| {
            let mut ledger = current.unwrap_or_else(|| CostLedger::empty(today));
            ledger.add(amount, today);
            ledger.session_cost = amount;
            ledger
        });
        ledger.stats(today)
    }

    /// Records the growth of a session's running total since its last
    /// observation. A total lower than the last one is treated as a restart.
    pub fn record_session_total(&self, session_id: &str, total: f64, now: DateTime<Utc>) -> CostStats {
        let today = local_date(now);
        if !total.is_finite() || total < 0.0 {
            return self.stats(now);
        }
        let ledger = self.store.update_at(COST_CACHE_KEY, now, |current| {
            let mut ledger = current.unwrap_or_else(|| CostLedger::empty(today));
            let previous = ledger
                .sessions
                .iter()
                .position(|entry| entry.id == session_id)
                .map(|index| ledger.sessions.remove(index).total);
            let delta = match previous {
                Some(previous) if total >= previous => total - previous,
                _ => total,
            };
            ledger.add(delta, today);
            ledger.session_cost = total;
            ledger.sessions.push(SessionTotal {
                id: session_id.to_string(),
                total,
            });
            let excess = ledger.sessions.len().saturating_sub(MAX_TRACKED_SESSIONS);
            ledger.sessions.drain(..excess);
            ledger
        });
        ledger.stats(today)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> CostStats {
        self.store
            .get_at(COST_CACHE_KEY, now)
            .map(|ledger| ledger.stats(local_date(now)))
            .unwrap_or_default()
    }
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}
