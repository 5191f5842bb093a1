//! Pre-trade risk checks for short-premium plays.
//!
//! Every STO submit passes through here first. Denials carry a structured
//! reason and leave the play in NEW; nothing is sent to the broker.

use crate::broker::Account;
use crate::play::{Play, PositionSide};

/// Wrapper for an order that passed all checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskApproved;

/// A denial with the reason the operator will read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskRefused {
    pub reason: String,
}

impl std::fmt::Display for RiskRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RiskGate {
    /// Cap on total short notional as a multiple of account equity.
    pub max_notional_leverage: f64,
    /// Cap on committed short buying power as a fraction of equity.
    pub max_capital_allocation: f64,
}

impl Default for RiskGate {
    fn default() -> Self {
        Self {
            max_notional_leverage: 1.5,
            max_capital_allocation: 0.5,
        }
    }
}

/// Cash-secured buying power a short play commits: strike × 100 × contracts.
pub fn required_buying_power(play: &Play) -> f64 {
    play.instrument.strike * 100.0 * f64::from(play.contracts)
}

impl RiskGate {
    pub fn new(max_notional_leverage: f64, max_capital_allocation: f64) -> Self {
        Self {
            max_notional_leverage,
            max_capital_allocation,
        }
    }

    /// Check a short open against the account and the already-open short
    /// book. LONG plays pass unconditionally (premium paid is its own cap).
    pub fn check_open(
        &self,
        play: &Play,
        account: &Account,
        open_plays: &[Play],
    ) -> Result<RiskApproved, RiskRefused> {
        if play.position_side == PositionSide::Long {
            return Ok(RiskApproved);
        }

        let required = required_buying_power(play);

        if required > account.options_buying_power {
            return Err(RiskRefused {
                reason: format!(
                    "insufficient options buying power: required={required:.0}, available={:.0}",
                    account.options_buying_power
                ),
            });
        }

        let open_short_notional: f64 = open_plays
            .iter()
            .filter(|p| p.position_side == PositionSide::Short && !p.state.is_terminal())
            .map(required_buying_power)
            .sum();

        let notional_cap = self.max_notional_leverage * account.equity;
        if open_short_notional + required > notional_cap {
            return Err(RiskRefused {
                reason: format!(
                    "notional leverage exceeded: open={open_short_notional:.0}, \
                     required={required:.0}, cap={notional_cap:.0}"
                ),
            });
        }

        let allocation_cap = self.max_capital_allocation * account.equity;
        if open_short_notional + required > allocation_cap {
            return Err(RiskRefused {
                reason: format!(
                    "capital allocation exceeded: open={open_short_notional:.0}, \
                     required={required:.0}, cap={allocation_cap:.0}"
                ),
            });
        }

        Ok(RiskApproved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::OptionSide;
    use crate::play::{EntrySpec, PlayState};
    use chrono::NaiveDate;

    fn short_put(strike: f64, contracts: u32) -> Play {
        let mut play = Play::new(
            "csp",
            "short_puts",
            "SPY",
            OptionSide::Put,
            strike,
            NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            PositionSide::Short,
            contracts,
            EntrySpec {
                target_stock_price: 500.0,
                reference: crate::play::PriceReference::Last,
                buffer: 100.0,
                order_policy: crate::play::OrderPolicy::LimitAtBid,
            },
        );
        play.fills.entry_premium = Some(2.50);
        play
    }

    fn account(obp: f64, equity: f64) -> Account {
        Account {
            cash: equity,
            buying_power: equity * 2.0,
            options_buying_power: obp,
            equity,
        }
    }

    #[test]
    fn required_bp_is_strike_times_100_times_contracts() {
        let play = short_put(450.0, 1);
        assert!((required_buying_power(&play) - 45_000.0).abs() < 1e-10);
        let play = short_put(450.0, 3);
        assert!((required_buying_power(&play) - 135_000.0).abs() < 1e-10);
    }

    #[test]
    fn insufficient_buying_power_denied_with_reason() {
        let gate = RiskGate::default();
        let play = short_put(450.0, 1); // needs 45,000
        let err = gate
            .check_open(&play, &account(30_000.0, 100_000.0), &[])
            .unwrap_err();
        assert_eq!(
            err.reason,
            "insufficient options buying power: required=45000, available=30000"
        );
    }

    #[test]
    fn sufficient_buying_power_approved() {
        let gate = RiskGate::default();
        let play = short_put(450.0, 1);
        gate.check_open(&play, &account(50_000.0, 100_000.0), &[])
            .unwrap();
    }

    #[test]
    fn notional_leverage_cap_counts_open_shorts() {
        let gate = RiskGate::new(1.0, 1.0);
        let candidate = short_put(450.0, 1); // 45,000
        let mut existing = short_put(600.0, 1); // 60,000 already open
        existing.state = PlayState::Open;

        // equity 100,000, cap = 100,000; 60,000 + 45,000 breaches it.
        let err = gate
            .check_open(
                &candidate,
                &account(200_000.0, 100_000.0),
                std::slice::from_ref(&existing),
            )
            .unwrap_err();
        assert!(err.reason.contains("notional leverage exceeded"));
    }

    #[test]
    fn capital_allocation_cap_applies() {
        let gate = RiskGate::new(10.0, 0.25); // generous leverage, tight allocation
        let candidate = short_put(450.0, 1); // 45,000 vs cap 25,000
        let err = gate
            .check_open(&candidate, &account(200_000.0, 100_000.0), &[])
            .unwrap_err();
        assert!(err.reason.contains("capital allocation exceeded"));
    }

    #[test]
    fn long_plays_pass_unconditionally() {
        let gate = RiskGate::new(0.0, 0.0);
        let play = Play::new(
            "call",
            "swings",
            "SPY",
            OptionSide::Call,
            500.0,
            NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
            PositionSide::Long,
            1,
            EntrySpec {
                target_stock_price: 500.0,
                reference: crate::play::PriceReference::Last,
                buffer: 0.5,
                order_policy: crate::play::OrderPolicy::LimitAtAsk,
            },
        );
        gate.check_open(&play, &account(0.0, 0.0), &[]).unwrap();
    }

    #[test]
    fn terminal_shorts_do_not_count_against_caps() {
        let gate = RiskGate::new(1.0, 1.0);
        let candidate = short_put(450.0, 1);
        let mut closed = short_put(600.0, 1);
        closed.state = PlayState::Closed;
        gate.check_open(
            &candidate,
            &account(200_000.0, 100_000.0),
            std::slice::from_ref(&closed),
        )
        .unwrap();
    }
}
