//! Cost Calculator (CC) — a pure function over (usage, model, modifiers),
//! grounded on `goobits-claude-usage/src/pricing.rs`'s token-type cost
//! breakdown idiom but built around the documented tiered-pricing algorithm
//! (long-context and fast-mode multiplier stacking).

use super::catalog::ModelPriceRow;

const LONG_CONTEXT_THRESHOLD: u64 = 200_000;

/// Usage record handed to CC, per the external-interfaces contract.
#[derive(Debug, Clone, Default)]
pub struct UsageInput {
    pub input: u64,
    pub output: u64,
    pub cache_create: u64,
    pub cache_read: u64,
    pub ephemeral_5m: Option<u64>,
    pub ephemeral_1h: Option<u64>,
    pub model: String,
    pub request_beta_header: Option<String>,
    pub speed: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CostBreakdown {
    pub has_pricing: bool,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cache_create_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub total_cost_usd: f64,
    /// `round(total_cost_usd * 1_000_000)`, the fixed-point storage form.
    pub real_cost_micro: i64,
    pub is_long_context_request: bool,
    pub is_fast_mode_request: bool,
}

impl CostBreakdown {
    fn no_pricing() -> Self {
        Self {
            has_pricing: false,
            input_cost_usd: 0.0,
            output_cost_usd: 0.0,
            cache_create_cost_usd: 0.0,
            cache_read_cost_usd: 0.0,
            total_cost_usd: 0.0,
            real_cost_micro: 0,
            is_long_context_request: false,
            is_fast_mode_request: false,
        }
    }
}

/// Resolved per-token rates after long-context and fast-mode adjustments,
/// before multiplying by token counts.
struct ResolvedRates {
    input: f64,
    output: f64,
    cache_create: f64,
    cache_read: f64,
}

pub fn calculate_cost(usage: &UsageInput, row: Option<&ModelPriceRow>) -> CostBreakdown {
    let Some(row) = row else { return CostBreakdown::no_pricing() };

    let total_input = usage.input + usage.cache_create + usage.cache_read;

    let beta_header = usage.request_beta_header.as_deref().unwrap_or("");
    let wants_1m = usage.model.ends_with("[1m]") || beta_header.contains("context-1m-");
    let is_long_context = wants_1m && total_input > LONG_CONTEXT_THRESHOLD;

    // Step 3: long-context rule — substitute explicit 200K+ rows if present,
    // otherwise derive from the base rates.
    let (lc_input, lc_output, lc_cache_create, lc_cache_read) = if is_long_context {
        let input_lc = row.input_200k.unwrap_or(row.input * 2.0);
        let output_lc = row.output_200k.unwrap_or(row.output * 1.5);
        let cache_create_lc = cache_create_rate_long_context(usage, row, input_lc);
        let cache_read_lc = row.cache_read_200k.unwrap_or(input_lc * 0.1);
        (input_lc, output_lc, cache_create_lc, cache_read_lc)
    } else {
        (row.input, row.output, cache_create_rate(usage, row), row.cache_read)
    };

    // Step 4: fast-mode rule — stacks multiplicatively on top of whatever
    // the long-context step produced; cache prices are re-derived from the
    // scaled input rather than also scaling the long-context cache prices.
    let is_fast_mode = beta_header.contains("fast-mode-") && usage.speed.as_deref() == Some("fast");
    let rates = if is_fast_mode {
        let input_final = lc_input * row.fast_mode_multiplier;
        let output_final = lc_output * row.fast_mode_multiplier;
        ResolvedRates {
            input: input_final,
            output: output_final,
            cache_create: input_final * 1.25,
            cache_read: input_final * 0.1,
        }
    } else {
        ResolvedRates {
            input: lc_input,
            output: lc_output,
            cache_create: lc_cache_create,
            cache_read: lc_cache_read,
        }
    };

    let input_cost = usage.input as f64 * rates.input;
    let output_cost = usage.output as f64 * rates.output;
    let cache_create_cost = usage.cache_create as f64 * rates.cache_create;
    let cache_read_cost = usage.cache_read as f64 * rates.cache_read;
    let total = input_cost + output_cost + cache_create_cost + cache_read_cost;

    CostBreakdown {
        has_pricing: true,
        input_cost_usd: input_cost,
        output_cost_usd: output_cost,
        cache_create_cost_usd: cache_create_cost,
        cache_read_cost_usd: cache_read_cost,
        total_cost_usd: total,
        real_cost_micro: (total * 1_000_000.0).round() as i64,
        is_long_context_request: is_long_context,
        is_fast_mode_request: is_fast_mode,
    }
}

/// Base (non-long-context) cache-creation rate: 1-hour ephemeral tokens, if
/// any were reported, are billed at the 1-hour rate; everything else (the
/// common case, and the 5-minute ephemeral slice) bills at the 5-minute rate.
fn cache_create_rate(usage: &UsageInput, row: &ModelPriceRow) -> f64 {
    match (usage.ephemeral_1h, usage.ephemeral_5m) {
        (Some(h), Some(m)) if h + m > 0 => {
            (h as f64 * row.cache_create_1h + m as f64 * row.cache_create_5m) / (h + m) as f64
        }
        (Some(h), None) if h > 0 && h == usage.cache_create => row.cache_create_1h,
        _ => row.cache_create_5m,
    }
}

/// Long-context counterpart of [`cache_create_rate`]: same 1-hour-vs-5-minute
/// ephemeral split, but against the explicit 200K+ cache-creation rows (or,
/// absent those, rates derived from the long-context input rate — `×2` for
/// the 1-hour slice, `×1.25` for the 5-minute one).
fn cache_create_rate_long_context(usage: &UsageInput, row: &ModelPriceRow, input_lc: f64) -> f64 {
    let rate_1h = row.cache_create_1h_200k.unwrap_or(input_lc * 2.0);
    let rate_5m = row.cache_create_5m_200k.unwrap_or(input_lc * 1.25);
    match (usage.ephemeral_1h, usage.ephemeral_5m) {
        (Some(h), Some(m)) if h + m > 0 => (h as f64 * rate_1h + m as f64 * rate_5m) / (h + m) as f64,
        (Some(h), None) if h > 0 && h == usage.cache_create => rate_1h,
        _ => rate_5m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sonnet_row() -> ModelPriceRow {
        ModelPriceRow {
            model: "claude-sonnet-4-20250514".to_string(),
            input: 3e-6,
            output: 1.5e-5,
            cache_create_5m: 3.75e-6,
            cache_create_1h: 6e-6,
            cache_read: 3e-7,
            input_200k: None,
            output_200k: None,
            cache_create_5m_200k: None,
            cache_create_1h_200k: None,
            cache_read_200k: None,
            fast_mode_multiplier: 6.0,
        }
    }

    fn opus_row() -> ModelPriceRow {
        ModelPriceRow {
            model: "claude-opus-4-6".to_string(),
            input: 5e-6,
            output: 2.5e-5,
            cache_create_5m: 6.25e-6,
            cache_create_1h: 1e-5,
            cache_read: 5e-7,
            input_200k: None,
            output_200k: None,
            cache_create_5m_200k: None,
            cache_create_1h_200k: None,
            cache_read_200k: None,
            fast_mode_multiplier: 6.0,
        }
    }

    #[test]
    fn missing_row_has_no_pricing() {
        let usage = UsageInput { model: "ghost-model".to_string(), ..Default::default() };
        let result = calculate_cost(&usage, None);
        assert!(!result.has_pricing);
    }

    /// Concrete scenario 3: long-context derived pricing, no fast mode.
    #[test]
    fn long_context_worked_example() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 150_000,
            output: 10_000,
            cache_create: 40_000,
            cache_read: 20_000,
            model: "claude-sonnet-4-20250514[1m]".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(result.is_long_context_request);
        assert!(!result.is_fast_mode_request);
        assert!((result.total_cost_usd - 1.437).abs() < 1e-9);
    }

    /// Concrete scenario 4: long-context and fast-mode stacking.
    #[test]
    fn long_context_and_fast_mode_stack() {
        let row = opus_row();
        let usage = UsageInput {
            input: 210_000,
            output: 1_000,
            cache_create: 10_000,
            cache_read: 10_000,
            model: "claude-opus-4-6".to_string(),
            request_beta_header: Some("fast-mode-2026-02-01,context-1m-2025-08-07".to_string()),
            speed: Some("fast".to_string()),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(result.is_long_context_request);
        assert!(result.is_fast_mode_request);

        let input_rate = result.input_cost_usd / usage.input as f64;
        let output_rate = result.output_cost_usd / usage.output as f64;
        assert!((input_rate - 6e-5).abs() < 1e-12);
        assert!((output_rate - 2.25e-4).abs() < 1e-12);
    }

    #[test]
    fn boundary_200000_uses_base_prices() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 200_000,
            output: 0,
            cache_create: 0,
            cache_read: 0,
            model: "claude-sonnet-4-20250514[1m]".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(!result.is_long_context_request, "200_000 is not strictly greater than the threshold");
    }

    #[test]
    fn boundary_200001_uses_long_context_prices() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 200_001,
            output: 0,
            cache_create: 0,
            cache_read: 0,
            model: "claude-sonnet-4-20250514[1m]".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(result.is_long_context_request);
    }

    #[test]
    fn real_cost_micro_round_trips() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 1_000,
            output: 500,
            cache_create: 0,
            cache_read: 0,
            model: "claude-sonnet-4-20250514".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        let back = result.real_cost_micro as f64 / 1_000_000.0;
        assert!((back - result.total_cost_usd).abs() <= 1e-6);
    }

    /// Long-context `ephemeral_1h` cache-creation tokens bill at `input_lc
    /// × 2` when the catalog carries no explicit `cache_create_1h_200k` row,
    /// not the 5-minute `× 1.25` derivation.
    #[test]
    fn long_context_ephemeral_1h_bills_at_double_input_rate() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 150_000,
            output: 0,
            cache_create: 40_000,
            cache_read: 0,
            ephemeral_1h: Some(40_000),
            model: "claude-sonnet-4-20250514[1m]".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(result.is_long_context_request);

        let input_lc = row.input_200k.unwrap_or(row.input * 2.0);
        let expected_cache_create_cost = 40_000.0 * (input_lc * 2.0);
        assert!((result.cache_create_cost_usd - expected_cache_create_cost).abs() < 1e-9);
    }

    /// An explicit `cache_create_1h_200k` catalog row takes precedence over
    /// the `× 2` derivation.
    #[test]
    fn long_context_ephemeral_1h_prefers_explicit_catalog_row() {
        let mut row = sonnet_row();
        row.cache_create_1h_200k = Some(9e-6);
        let usage = UsageInput {
            input: 150_000,
            output: 0,
            cache_create: 40_000,
            cache_read: 0,
            ephemeral_1h: Some(40_000),
            model: "claude-sonnet-4-20250514[1m]".to_string(),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!((result.cache_create_cost_usd - 40_000.0 * 9e-6).abs() < 1e-9);
    }

    #[test]
    fn header_based_long_context_without_1m_suffix() {
        let row = sonnet_row();
        let usage = UsageInput {
            input: 250_000,
            output: 0,
            cache_create: 0,
            cache_read: 0,
            model: "claude-sonnet-4-20250514".to_string(),
            request_beta_header: Some("context-1m-2025-08-07".to_string()),
            ..Default::default()
        };
        let result = calculate_cost(&usage, Some(&row));
        assert!(result.is_long_context_request);
    }
}
