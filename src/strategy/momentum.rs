//! Momentum playbook runner.
//!
//! Reads a YAML playbook of gap/momentum setups at cycle start and
//! instantiates plays for the setups whose gap condition holds and that are
//! not already represented by an active play. Trigger evaluation from there
//! on is the shared lifecycle path.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{CycleCtx, Strategy};
use crate::error::{EngineError, Result};
use crate::market::OptionSide;
use crate::play::{EntrySpec, Play, StopLossSpec, TakeProfitSpec};

const PLAYBOOK_FILE: &str = "playbooks/momentum.yaml";

pub struct MomentumStrategy;

#[derive(Debug, Deserialize)]
struct Playbook {
    #[serde(default)]
    plays: Vec<PlaybookEntry>,
}

#[derive(Debug, Deserialize)]
struct PlaybookEntry {
    name: String,
    symbol: String,
    side: OptionSide,
    strike: f64,
    expiration: NaiveDate,
    /// Required overnight gap in the favorable direction, as a fraction of
    /// the prior close (0.01 = 1%).
    gap_pct: f64,
    entry: EntrySpec,
    #[serde(default)]
    take_profit: TakeProfitSpec,
    #[serde(default)]
    stop_loss: StopLossSpec,
    #[serde(default = "default_contracts")]
    contracts: u32,
}

fn default_contracts() -> u32 {
    1
}

impl MomentumStrategy {
    fn load_playbook(ctx: &CycleCtx) -> Result<Option<Playbook>> {
        // The playbook lives beside the play tree in the data root.
        let data_root = ctx
            .store
            .root()
            .parent()
            .map_or_else(|| crate::config::data_root(), std::path::Path::to_path_buf);
        let path = data_root.join(PLAYBOOK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let playbook: Playbook = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Validation(format!("momentum playbook: {e}")))?;
        Ok(Some(playbook))
    }

    /// Overnight gap from prior close to the current price, signed so that
    /// positive is favorable for the entry's side.
    async fn gap_fraction(ctx: &CycleCtx, entry: &PlaybookEntry) -> Result<f64> {
        let candles = ctx.market.get_daily_candles(&entry.symbol, 5).await?;
        let today = ctx.clock.today();
        let prior_close = candles
            .iter()
            .filter(|c| c.date < today)
            .max_by_key(|c| c.date)
            .map(|c| c.close)
            .ok_or_else(|| EngineError::NoData {
                key: format!("candles:{}", entry.symbol),
            })?;
        let current = ctx.market.get_stock_quote(&entry.symbol).await?.last;
        let raw = (current - prior_close) / prior_close;
        Ok(match entry.side {
            OptionSide::Call => raw,
            OptionSide::Put => -raw,
        })
    }

    fn instantiate(entry: &PlaybookEntry) -> Play {
        let mut play = Play::new(
            &entry.name,
            "momentum",
            &entry.symbol,
            entry.side,
            entry.strike,
            entry.expiration,
            crate::play::PositionSide::Long,
            entry.contracts,
            entry.entry.clone(),
        );
        play.creator = "momentum-playbook".to_string();
        play.take_profit = entry.take_profit.clone();
        play.stop_loss = entry.stop_loss.clone();
        play
    }
}

#[async_trait]
impl Strategy for MomentumStrategy {
    fn tag(&self) -> &'static str {
        "momentum"
    }

    async fn on_cycle_start(&self, ctx: &CycleCtx) -> Result<()> {
        let Some(playbook) = Self::load_playbook(ctx)? else {
            return Ok(());
        };

        for entry in &playbook.plays {
            if super::helpers::has_active_play(ctx, self.tag(), &entry.symbol)? {
                continue;
            }
            let gap = match Self::gap_fraction(ctx, entry).await {
                Ok(gap) => gap,
                Err(e) => {
                    tracing::warn!(setup = %entry.name, error = %e, "gap check skipped");
                    continue;
                }
            };
            if gap < entry.gap_pct {
                continue;
            }

            let play = Self::instantiate(entry);
            play.validate_record()?;
            ctx.store.save(&play)?;
            tracing::info!(
                play_id = %play.id,
                setup = %entry.name,
                gap = format!("{:.2}%", gap * 100.0),
                "momentum setup instantiated"
            );
        }
        Ok(())
    }
}
