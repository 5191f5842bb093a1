//! `once` — run a single tick and exit. Useful from cron and in tests.

use std::path::Path;

use crate::error::Result;
use crate::orchestrator::{enabled_strategies, Orchestrator};

pub async fn run(data_root: &Path, force_dry_run: bool) -> Result<()> {
    let ctx = super::bootstrap(data_root, force_dry_run)?;
    let strategies = enabled_strategies(&ctx.config);
    tracing::info!(
        strategies = ?strategies.iter().map(|s| s.tag()).collect::<Vec<_>>(),
        "running one tick"
    );
    let mut orchestrator = Orchestrator::new(ctx, strategies);
    orchestrator.tick().await
}
