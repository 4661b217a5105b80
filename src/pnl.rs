// =============================================================================
// PnL accounting — fee/slippage-adjusted percentage returns
// =============================================================================
//
// Fees and slippage are charged symmetrically on both legs: a long pays more
// than the quoted price to get in and receives less than the quoted price to
// get out, and a short is the mirror image. All percentages are percent of
// the effective open.
//
// Positions with a partial-close ledger settle as the weighted sum of each
// ledger entry's PnL at its recorded price plus the remainder at the final
// close price.
// =============================================================================

use crate::signal::SignalRow;
use crate::types::Side;

/// Percentage-PnL calculator for a fixed fee + slippage schedule.
#[derive(Debug, Clone, Copy)]
pub struct PnlCalculator {
    /// Fee + slippage charged on one transaction, in percent.
    cost_percent: f64,
}

impl PnlCalculator {
    pub fn new(percent_fee: f64, percent_slippage: f64) -> Self {
        Self {
            cost_percent: percent_fee + percent_slippage,
        }
    }

    fn cost_fraction(&self) -> f64 {
        self.cost_percent / 100.0
    }

    /// Price actually paid (long) or received (short) when entering at the
    /// quoted `price`.
    pub fn effective_open(&self, side: Side, price: f64) -> f64 {
        match side {
            Side::Long => price * (1.0 + self.cost_fraction()),
            Side::Short => price * (1.0 - self.cost_fraction()),
        }
    }

    /// Price actually received (long) or paid (short) when exiting at the
    /// quoted `price`.
    pub fn effective_close(&self, side: Side, price: f64) -> f64 {
        match side {
            Side::Long => price * (1.0 - self.cost_fraction()),
            Side::Short => price * (1.0 + self.cost_fraction()),
        }
    }

    /// Percentage PnL for the full position entered at `open` and exited at
    /// `close` (both quoted prices).
    pub fn percent(&self, side: Side, open: f64, close: f64) -> f64 {
        let eff_open = self.effective_open(side, open);
        let eff_close = self.effective_close(side, close);
        if eff_open == 0.0 {
            return 0.0;
        }
        match side {
            Side::Long => (eff_close - eff_open) / eff_open * 100.0,
            Side::Short => (eff_open - eff_close) / eff_open * 100.0,
        }
    }

    /// Final PnL of `row` closed at `close_price`, weighted across its
    /// partial-close ledger.
    ///
    /// Each ledger entry contributes `percent/100` of the position at its
    /// recorded price; the remainder settles at `close_price`. The ledger sum
    /// is clipped at 100% so an over-full ledger can never flip the sign of
    /// the remainder.
    pub fn weighted_percent(&self, row: &SignalRow, close_price: f64) -> f64 {
        if row.partials.is_empty() {
            return self.percent(row.side, row.price_open, close_price);
        }

        let mut closed_total = 0.0_f64;
        let mut pnl = 0.0_f64;

        for entry in &row.partials {
            let available = (100.0 - closed_total).max(0.0);
            let weight = entry.percent.min(available);
            if weight <= 0.0 {
                break;
            }
            pnl += weight / 100.0 * self.percent(row.side, row.price_open, entry.price);
            closed_total += weight;
        }

        let remainder = (100.0 - closed_total).max(0.0);
        pnl += remainder / 100.0 * self.percent(row.side, row.price_open, close_price);
        pnl
    }
}
