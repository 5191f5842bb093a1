//! `run` — start the orchestrated tick loop until ctrl-c.

use std::path::Path;

use crate::error::{EngineError, Result};
use crate::orchestrator::{enabled_strategies, Orchestrator};

pub async fn run(data_root: &Path, force_dry_run: bool) -> Result<()> {
    let ctx = super::bootstrap(data_root, force_dry_run)?;

    if !ctx.config.orchestration.enabled {
        return Err(EngineError::Config(
            "orchestration.enabled is false; nothing to run".into(),
        ));
    }

    let strategies = enabled_strategies(&ctx.config);
    tracing::info!(
        strategies = ?strategies.iter().map(|s| s.tag()).collect::<Vec<_>>(),
        interval_s = ctx.config.orchestration.tick_interval_s,
        mode = ?ctx.config.orchestration.mode,
        dry_run = ctx.executor.dry_run(),
        "starting orchestrated loop"
    );

    let mut orchestrator = Orchestrator::new(ctx, strategies);
    orchestrator
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
