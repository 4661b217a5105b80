// =============================================================================
// Signal validation — every admission rule checked, every failure reported
// =============================================================================
//
// The validator is a pure function: it inspects a prospective signal row
// against the current price and the configured distance bounds, and returns
// either Ok or the full list of violated rules. It never mutates and never
// short-circuits; a malformed signal reports all of its problems at once.
// =============================================================================

use crate::config::EngineConfig;
use crate::signal::SignalRow;
use crate::types::Side;

/// All admission rules a prospective signal violated.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub errors: Vec<String>,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signal validation failed: {}", self.errors.join("; "))
    }
}

impl std::error::Error for ValidationFailure {}

/// Validate a prospective signal row.
///
/// `is_scheduled` selects the entry-side rule: immediate signals must have
/// the *current* price strictly between stop-loss and take-profit, scheduled
/// signals must have their *entry* price there instead.
pub fn validate_signal(
    row: &SignalRow,
    current_price: f64,
    is_scheduled: bool,
    config: &EngineConfig,
) -> Result<(), ValidationFailure> {
    let mut errors: Vec<String> = Vec::new();

    // --- 1. Identity --------------------------------------------------------
    if row.id.trim().is_empty() {
        errors.push("id must not be empty".into());
    }
    if row.symbol.trim().is_empty() {
        errors.push("symbol must not be empty".into());
    }
    if row.exchange_name.trim().is_empty() {
        errors.push("exchange_name must not be empty".into());
    }
    if row.strategy_name.trim().is_empty() {
        errors.push("strategy_name must not be empty".into());
    }

    // --- 2. Price sanity ----------------------------------------------------
    if !current_price.is_finite() || current_price <= 0.0 {
        errors.push(format!("current price {current_price} must be finite and positive"));
    }
    for (name, value) in [
        ("price_open", row.price_open),
        ("price_take_profit", row.price_take_profit),
        ("price_stop_loss", row.price_stop_loss),
    ] {
        if !value.is_finite() || value <= 0.0 {
            errors.push(format!("{name} {value} must be finite and positive"));
        }
    }

    // --- 3. Position-consistent ordering ------------------------------------
    match row.side {
        Side::Long => {
            if row.price_stop_loss >= row.price_open {
                errors.push(format!(
                    "long stop-loss {} must be below open {}",
                    row.price_stop_loss, row.price_open
                ));
            }
            if row.price_take_profit <= row.price_open {
                errors.push(format!(
                    "long take-profit {} must be above open {}",
                    row.price_take_profit, row.price_open
                ));
            }
            if row.price_stop_loss >= row.price_take_profit {
                errors.push(format!(
                    "long stop-loss {} must be below take-profit {}",
                    row.price_stop_loss, row.price_take_profit
                ));
            }
        }
        Side::Short => {
            if row.price_stop_loss <= row.price_open {
                errors.push(format!(
                    "short stop-loss {} must be above open {}",
                    row.price_stop_loss, row.price_open
                ));
            }
            if row.price_take_profit >= row.price_open {
                errors.push(format!(
                    "short take-profit {} must be below open {}",
                    row.price_take_profit, row.price_open
                ));
            }
            if row.price_take_profit >= row.price_stop_loss {
                errors.push(format!(
                    "short take-profit {} must be below stop-loss {}",
                    row.price_take_profit, row.price_stop_loss
                ));
            }
        }
    }

    // --- 4/5. Entry side must not close on the next tick --------------------
    let lo = row.price_stop_loss.min(row.price_take_profit);
    let hi = row.price_stop_loss.max(row.price_take_profit);
    if is_scheduled {
        if !(row.price_open > lo && row.price_open < hi) {
            errors.push(format!(
                "scheduled entry price {} must lie strictly between stop-loss and take-profit",
                row.price_open
            ));
        }
    } else if !(current_price > lo && current_price < hi) {
        errors.push(format!(
            "current price {current_price} must lie strictly between stop-loss and take-profit"
        ));
    }

    // --- 6. Take-profit distance ---------------------------------------------
    if row.price_open > 0.0 {
        let tp_distance =
            (row.price_take_profit - row.price_open).abs() / row.price_open * 100.0;
        if tp_distance < config.min_take_profit_distance_percent {
            errors.push(format!(
                "take-profit distance {:.4}% below minimum {:.4}%",
                tp_distance, config.min_take_profit_distance_percent
            ));
        }

        // --- 7. Stop-loss distance bounds ------------------------------------
        let sl_distance = (row.price_stop_loss - row.price_open).abs() / row.price_open * 100.0;
        if sl_distance < config.min_stop_loss_distance_percent {
            errors.push(format!(
                "stop-loss distance {:.4}% below minimum {:.4}%",
                sl_distance, config.min_stop_loss_distance_percent
            ));
        }
        if sl_distance > config.max_stop_loss_distance_percent {
            errors.push(format!(
                "stop-loss distance {:.4}% above maximum {:.4}%",
                sl_distance, config.max_stop_loss_distance_percent
            ));
        }
    }

    // --- 8. Lifetime ---------------------------------------------------------
    if row.minute_estimated_time <= 0 {
        errors.push(format!(
            "minute_estimated_time {} must be positive",
            row.minute_estimated_time
        ));
    } else if row.minute_estimated_time > config.max_signal_lifetime_minutes {
        errors.push(format!(
            "minute_estimated_time {} exceeds maximum {}",
            row.minute_estimated_time, config.max_signal_lifetime_minutes
        ));
    }

    // --- 9. Timestamps -------------------------------------------------------
    if row.scheduled_at <= 0 {
        errors.push(format!("scheduled_at {} must be positive", row.scheduled_at));
    }
    if row.pending_at <= 0 {
        errors.push(format!("pending_at {} must be positive", row.pending_at));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure { errors })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            min_take_profit_distance_percent: 1.0,
            min_stop_loss_distance_percent: 0.5,
            max_stop_loss_distance_percent: 15.0,
            max_signal_lifetime_minutes: 1_440,
            ..EngineConfig::default()
        }
    }

    fn long_row() -> SignalRow {
        SignalRow {
            id: "sig-1".into(),
            symbol: "BTCUSDT".into(),
            exchange_name: "binance".into(),
            strategy_name: "demo".into(),
            frame_name: String::new(),
            side: Side::Long,
            price_open: 100.0,
            price_take_profit: 105.0,
            price_stop_loss: 95.0,
            minute_estimated_time: 60,
            note: None,
            scheduled_at: 1_000,
            pending_at: 1_000,
            is_scheduled: false,
            partials: Vec::new(),
            trailing_price_stop_loss: None,
            trailing_price_take_profit: None,
        }
    }

    fn short_row() -> SignalRow {
        let mut row = long_row();
        row.side = Side::Short;
        row.price_take_profit = 95.0;
        row.price_stop_loss = 105.0;
        row
    }

    #[test]
    fn valid_long_passes() {
        validate_signal(&long_row(), 100.0, false, &config()).unwrap();
    }

    #[test]
    fn valid_short_passes() {
        validate_signal(&short_row(), 100.0, false, &config()).unwrap();
    }

    #[test]
    fn empty_identity_rejected() {
        let mut row = long_row();
        row.symbol = String::new();
        row.id = "  ".into();
        let err = validate_signal(&row, 100.0, false, &config()).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("symbol")));
        assert!(err.errors.iter().any(|e| e.contains("id")));
    }

    #[test]
    fn non_finite_prices_rejected() {
        let mut row = long_row();
        row.price_take_profit = f64::NAN;
        let err = validate_signal(&row, 100.0, false, &config()).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("price_take_profit")));
    }

    #[test]
    fn long_ordering_enforced() {
        let mut row = long_row();
        row.price_stop_loss = 101.0; // above open
        let err = validate_signal(&row, 100.0, false, &config()).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("stop-loss")));
    }

    #[test]
    fn short_ordering_enforced() {
        let mut row = short_row();
        row.price_take_profit = 106.0; // above open
        assert!(validate_signal(&row, 100.0, false, &config()).is_err());
    }

    #[test]
    fn immediate_price_outside_band_rejected() {
        // Current price already past the take-profit.
        let err = validate_signal(&long_row(), 106.0, false, &config()).unwrap_err();
        assert!(err
            .errors
            .iter()
            .any(|e| e.contains("strictly between")));
    }

    #[test]
    fn scheduled_checks_entry_not_current() {
        // Current price far outside the band is fine for a scheduled signal;
        // what matters is the entry level.
        let mut row = long_row();
        row.is_scheduled = true;
        validate_signal(&row, 200.0, true, &config()).unwrap();
    }

    #[test]
    fn tp_distance_floor() {
        let mut row = long_row();
        row.price_take_profit = 100.5; // 0.5% < 1.0% minimum
        let err = validate_signal(&row, 100.0, false, &config()).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("take-profit distance")));
    }

    #[test]
    fn sl_distance_bounds() {
        let mut row = long_row();
        row.price_stop_loss = 99.9; // 0.1% < 0.5% minimum
        assert!(validate_signal(&row, 100.0, false, &config()).is_err());

        let mut row = long_row();
        row.price_stop_loss = 80.0; // 20% > 15% maximum
        assert!(validate_signal(&row, 100.0, false, &config()).is_err());
    }

    #[test]
    fn lifetime_bounds() {
        let mut row = long_row();
        row.minute_estimated_time = 0;
        assert!(validate_signal(&row, 100.0, false, &config()).is_err());

        let mut row = long_row();
        row.minute_estimated_time = 10_000;
        assert!(validate_signal(&row, 100.0, false, &config()).is_err());
    }

    #[test]
    fn all_failures_accumulate() {
        let mut row = long_row();
        row.symbol = String::new();
        row.price_take_profit = 100.2; // distance floor
        row.minute_estimated_time = -3;
        row.scheduled_at = 0;
        let err = validate_signal(&row, 100.0, false, &config()).unwrap_err();
        assert!(err.errors.len() >= 4, "got: {:?}", err.errors);
    }
}
