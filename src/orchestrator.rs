//! Cycle orchestration.
//!
//! Single-threaded cooperative ticks at a configured interval. Each tick
//! runs four phases in order — `on_cycle_start`, `evaluate_new_plays`,
//! `evaluate_open_plays`, `on_cycle_end` — invoking every enabled strategy
//! per phase, either sequentially or on a bounded worker pool. A tick is
//! never interrupted mid-phase; shutdown drains the in-flight tick first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::config::ExecutionMode;
use crate::error::Result;
use crate::strategy::{CycleCtx, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CycleStart,
    NewPlays,
    OpenPlays,
    CycleEnd,
}

impl Phase {
    const ORDER: [Phase; 4] = [
        Phase::CycleStart,
        Phase::NewPlays,
        Phase::OpenPlays,
        Phase::CycleEnd,
    ];

    fn name(self) -> &'static str {
        match self {
            Phase::CycleStart => "on_cycle_start",
            Phase::NewPlays => "evaluate_new_plays",
            Phase::OpenPlays => "evaluate_open_plays",
            Phase::CycleEnd => "on_cycle_end",
        }
    }
}

async fn run_strategy_phase(
    strategy: &Arc<dyn Strategy>,
    ctx: &CycleCtx,
    phase: Phase,
) -> Result<()> {
    match phase {
        Phase::CycleStart => strategy.on_cycle_start(ctx).await,
        Phase::NewPlays => strategy.evaluate_new_plays(ctx).await,
        Phase::OpenPlays => strategy.evaluate_open_plays(ctx).await,
        Phase::CycleEnd => strategy.on_cycle_end(ctx).await,
    }
}

pub struct Orchestrator {
    ctx: Arc<CycleCtx>,
    strategies: Vec<Arc<dyn Strategy>>,
    mode: ExecutionMode,
    max_workers: usize,
    tick_interval: Duration,
    /// Interval for the minimal swings-only path once fallback engages.
    legacy_interval: Duration,
    fallback_to_legacy: bool,
    /// Set after an unrecoverable orchestration error: only the manual
    /// swings path runs for the remainder of the session.
    fallback_active: bool,
}

impl Orchestrator {
    pub fn new(ctx: Arc<CycleCtx>, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        let orchestration = &ctx.config.orchestration;
        let mode = orchestration.mode;
        let max_workers = orchestration.max_parallel_workers;
        let tick_interval = Duration::from_secs(orchestration.tick_interval_s);
        let legacy_interval = Duration::from_secs(ctx.config.monitoring.polling_interval_s);
        let fallback_to_legacy = orchestration.fallback_to_legacy;
        Self {
            ctx,
            strategies,
            mode,
            max_workers,
            tick_interval,
            legacy_interval,
            fallback_to_legacy,
            fallback_active: false,
        }
    }

    fn current_interval(&self) -> Duration {
        if self.fallback_active {
            self.legacy_interval
        } else {
            self.tick_interval
        }
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    fn active_strategies(&self) -> Vec<Arc<dyn Strategy>> {
        if self.fallback_active {
            self.strategies
                .iter()
                .filter(|s| s.tag() == "swings")
                .cloned()
                .collect()
        } else {
            self.strategies.clone()
        }
    }

    /// One complete tick: all four phases across all active strategies.
    pub async fn tick(&mut self) -> Result<()> {
        let strategies = self.active_strategies();
        if strategies.is_empty() {
            tracing::warn!("no enabled strategies; tick is a no-op");
            return Ok(());
        }

        self.ctx.begin_cycle();

        for phase in Phase::ORDER {
            if let Err(e) = self.run_phase(phase, &strategies).await {
                if self.fallback_to_legacy && !self.fallback_active {
                    tracing::error!(
                        phase = phase.name(),
                        error = %e,
                        "orchestration failed; falling back to manual swings"
                    );
                    self.fallback_active = true;
                    return Ok(());
                }
                return Err(e);
            }
        }

        self.ctx.market.log_fallback_summary();
        Ok(())
    }

    /// Run one phase for every strategy. Per-strategy errors short of Fatal
    /// are contained by the strategy helpers; anything that reaches here is
    /// an orchestration failure for the tick.
    async fn run_phase(&self, phase: Phase, strategies: &[Arc<dyn Strategy>]) -> Result<()> {
        tracing::debug!(phase = phase.name(), "phase start");
        match self.mode {
            ExecutionMode::Sequential => {
                for strategy in strategies {
                    phase_boundary(
                        strategy.tag(),
                        phase,
                        run_strategy_phase(strategy, &self.ctx, phase).await,
                    )?;
                }
            }
            ExecutionMode::Parallel => {
                // Bounded worker pool. Per-play writes still serialize on the
                // store's per-play locks, so overlapping ownership is safe,
                // just wasteful.
                let semaphore = Arc::new(Semaphore::new(self.max_workers));
                let tasks = strategies.iter().map(|strategy| {
                    let strategy = Arc::clone(strategy);
                    let ctx = Arc::clone(&self.ctx);
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit = semaphore.acquire().await.expect("semaphore open");
                        let result = run_strategy_phase(&strategy, &ctx, phase).await;
                        (strategy.tag(), result)
                    }
                });
                for (tag, result) in join_all(tasks).await {
                    phase_boundary(tag, phase, result)?;
                }
            }
        }
        Ok(())
    }

    /// Run ticks until `shutdown` resolves. The in-flight tick always
    /// completes; a tick that overruns the interval causes the next one to
    /// be skipped with a warning rather than piling up.
    pub async fn run(&mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut current = self.current_interval();
        let mut interval = tokio::time::interval(current);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested; exiting after completed tick");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "fatal orchestration error");
                            return Err(e);
                        }
                        tracing::error!(error = %e, "tick failed");
                    }
                    let elapsed = started.elapsed();
                    if elapsed > current {
                        tracing::warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            interval_ms = current.as_millis() as u64,
                            "tick overran the interval; next tick will be skipped"
                        );
                    }
                    // Entering fallback switches to the legacy polling pace.
                    if self.current_interval() != current {
                        current = self.current_interval();
                        interval = tokio::time::interval(current);
                        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    }
                }
            }
        }
    }
}

fn phase_boundary(tag: &str, phase: Phase, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            // Contained: the strategy lost this phase, the tick goes on.
            tracing::error!(strategy = tag, phase = phase.name(), error = %e, "strategy phase failed");
            Ok(())
        }
    }
}

/// Build the strategy list for the session: registry order filtered by the
/// per-strategy enable flags.
pub fn enabled_strategies(config: &crate::config::Config) -> Vec<Arc<dyn Strategy>> {
    crate::strategy::all_strategies()
        .into_iter()
        .filter(|s| config.strategy(s.tag()).enabled)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn phase_order_is_fixed() {
        let names: Vec<&str> = Phase::ORDER.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "on_cycle_start",
                "evaluate_new_plays",
                "evaluate_open_plays",
                "on_cycle_end"
            ]
        );
    }

    #[test]
    fn enabled_strategies_respect_config() {
        let raw = r"
            [strategies.swings]
            enabled = true

            [strategies.short_puts]
            enabled = true

            [strategies.momentum]
            enabled = false
        ";
        let config = Config::from_str(raw).unwrap();
        let tags: Vec<&str> = enabled_strategies(&config).iter().map(|s| s.tag()).collect();
        assert_eq!(tags, vec!["swings", "short_puts"]);
    }

    #[test]
    fn no_strategies_when_nothing_enabled() {
        let config = Config::from_str("").unwrap();
        assert!(enabled_strategies(&config).is_empty());
    }
}
