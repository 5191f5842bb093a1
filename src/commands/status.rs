//! `status` — dump per-state play counts, quarantine count, and the last
//! recorded error per play.

use std::path::Path;

use crate::error::Result;
use crate::play::store::PlayStore;
use crate::play::PlayState;

pub fn run(data_root: &Path) -> Result<()> {
    let store = PlayStore::open(data_root)?;

    println!("play counts");
    let counts = store.counts()?;
    for (state, count) in &counts {
        println!("  {state:<16} {count}");
    }
    println!("  {:<16} {}", "quarantined", store.quarantine_count());

    let mut errors: Vec<(String, String, String)> = Vec::new();
    for state in PlayState::ALL {
        for play in store.snapshot(state)? {
            if let Some(last_error) = &play.audit.last_error {
                errors.push((play.id.clone(), state.dir_name().to_string(), last_error.clone()));
            }
        }
    }
    if !errors.is_empty() {
        println!("\nlast errors");
        for (id, state, error) in errors {
            println!("  {id} [{state}]: {error}");
        }
    }
    Ok(())
}
