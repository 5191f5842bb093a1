//! `validate` — revalidate every play record in every state directory.
//!
//! Read-only: unlike the live loader this never quarantines, it only
//! reports. A non-zero failure count maps to exit code 2.

use std::path::Path;

use crate::error::{EngineError, Result};
use crate::play::store::PlayStore;
use crate::play::PlayState;

pub fn run(data_root: &Path) -> Result<()> {
    let store = PlayStore::open(data_root)?;

    let mut checked = 0usize;
    let mut failures: Vec<(String, String)> = Vec::new();

    for state in PlayState::ALL {
        for id in store.list(state)? {
            checked += 1;
            if let Err(e) = store.check(&id) {
                failures.push((id, e.to_string()));
            }
        }
    }

    println!("checked {checked} play records");
    if failures.is_empty() {
        println!("all records valid");
        return Ok(());
    }

    for (id, error) in &failures {
        println!("INVALID {id}: {error}");
    }
    Err(EngineError::Validation(format!(
        "{} of {checked} play records failed validation",
        failures.len()
    )))
}
