//! Durable play repository.
//!
//! One directory per lifecycle state; a play record lives in exactly one of
//! them and moving the file between directories IS the state transition.
//! Every write is an atomic replace (serialize to a sibling temp file, fsync,
//! rename). A crash between the record write and the directory move leaves
//! the play in its previous state, never duplicated: the directory, not the
//! embedded state field, is authoritative on load.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use super::{migrate, Play, PlayState};
use crate::error::{EngineError, Result};

const QUARANTINE_DIR: &str = "quarantine";
const ARCHIVE_DIR: &str = "archive";

pub struct PlayStore {
    root: PathBuf,
    /// Per-play advisory locks. Writes serialize per play; reads are
    /// lock-free snapshots.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PlayStore {
    /// Open (creating if needed) a store rooted at `<data_root>/plays`.
    pub fn open(data_root: &Path) -> Result<Self> {
        let root = data_root.join("plays");
        for state in PlayState::ALL {
            fs::create_dir_all(root.join(state.dir_name()))
                .map_err(|e| EngineError::Fatal(format!("cannot create play store: {e}")))?;
        }
        fs::create_dir_all(root.join(QUARANTINE_DIR))
            .map_err(|e| EngineError::Fatal(format!("cannot create quarantine dir: {e}")))?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, play_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(play_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn file_name(play_id: &str) -> String {
        format!("{play_id}.json")
    }

    fn path_in(&self, state: PlayState, play_id: &str) -> PathBuf {
        self.root
            .join(state.dir_name())
            .join(Self::file_name(play_id))
    }

    /// Locate a play's file by scanning the state directories. The invariant
    /// is that at most one directory contains it.
    fn locate(&self, play_id: &str) -> Option<(PlayState, PathBuf)> {
        for state in PlayState::ALL {
            let path = self.path_in(state, play_id);
            if path.exists() {
                return Some((state, path));
            }
        }
        None
    }

    /// Ids of plays currently in `state`, sorted for deterministic cycles.
    pub fn list(&self, state: PlayState) -> Result<Vec<String>> {
        let dir = self.root.join(state.dir_name());
        let mut ids = Vec::new();
        let entries = fs::read_dir(&dir)
            .map_err(|e| EngineError::Fatal(format!("cannot read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::Fatal(e.to_string()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load and validate one play. The directory the file sits in overrides
    /// any state recorded inside the file (crash-recovery rule). Malformed
    /// records are quarantined and reported, never silently dropped.
    pub fn load(&self, play_id: &str) -> Result<Play> {
        let Some((dir_state, path)) = self.locate(play_id) else {
            return Err(EngineError::Validation(format!(
                "play {play_id} not found in any state directory"
            )));
        };

        match self.read_record(&path, dir_state) {
            Ok(play) => Ok(play),
            Err(e) => {
                self.quarantine(play_id, &path, &e.to_string())?;
                Err(EngineError::Integrity(format!(
                    "play {play_id} quarantined: {e}"
                )))
            }
        }
    }

    /// Read-only validation of one record: like `load` but never
    /// quarantines. Used by the `validate` command.
    pub fn check(&self, play_id: &str) -> Result<Play> {
        let Some((dir_state, path)) = self.locate(play_id) else {
            return Err(EngineError::Validation(format!(
                "play {play_id} not found in any state directory"
            )));
        };
        self.read_record(&path, dir_state)
    }

    fn read_record(&self, path: &Path, dir_state: PlayState) -> Result<Play> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::Validation(format!("unreadable record: {e}")))?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Validation(format!("invalid JSON: {e}")))?;

        let migrations = migrate::migrate(&mut value);
        if !migrations.is_empty() {
            tracing::debug!(path = %path.display(), ?migrations, "migrated legacy record");
        }

        let mut play: Play = serde_json::from_value(value)
            .map_err(|e| EngineError::Validation(format!("schema mismatch: {e}")))?;

        if play.state != dir_state {
            tracing::warn!(
                play_id = %play.id,
                recorded = %play.state,
                directory = %dir_state,
                "state field disagrees with directory; directory wins"
            );
            play.state = dir_state;
        }

        play.validate_record()?;
        Ok(play)
    }

    /// All valid plays in `state`. Malformed records are quarantined with a
    /// warning and skipped so one bad file cannot stop a cycle.
    pub fn snapshot(&self, state: PlayState) -> Result<Vec<Play>> {
        let mut plays = Vec::new();
        for id in self.list(state)? {
            match self.load(&id) {
                Ok(play) => plays.push(play),
                Err(e) => tracing::warn!(play_id = %id, error = %e, "skipping bad play"),
            }
        }
        Ok(plays)
    }

    /// Atomic write of `play` into its current state directory.
    pub fn save(&self, play: &Play) -> Result<()> {
        let lock = self.lock_for(&play.id);
        let _guard = lock.lock().expect("play lock poisoned");
        self.write_atomic(&self.path_in(play.state, &play.id), play)
    }

    fn write_atomic(&self, dest: &Path, play: &Play) -> Result<()> {
        let tmp = dest.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(play)
            .map_err(|e| EngineError::Fatal(format!("cannot serialize play {}: {e}", play.id)))?;

        let mut file = fs::File::create(&tmp)
            .map_err(|e| EngineError::Fatal(format!("cannot create {}: {e}", tmp.display())))?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .map_err(|e| EngineError::Fatal(format!("cannot write {}: {e}", tmp.display())))?;
        drop(file);

        fs::rename(&tmp, dest)
            .map_err(|e| EngineError::Fatal(format!("cannot rename into {}: {e}", dest.display())))
    }

    /// Transition `play` to `new_state`: write the updated record durably in
    /// the current directory first, then move the file. Rejected transitions
    /// are errors, not silent no-ops.
    pub fn transition(&self, play: &mut Play, new_state: PlayState) -> Result<()> {
        if !play.state.can_transition(new_state) {
            return Err(EngineError::Integrity(format!(
                "play {}: illegal transition {} -> {}",
                play.id, play.state, new_state
            )));
        }

        let lock = self.lock_for(&play.id);
        let _guard = lock.lock().expect("play lock poisoned");

        let old_state = play.state;
        let from = self.path_in(old_state, &play.id);
        let to = self.path_in(new_state, &play.id);

        // Durable record first; if we crash after this write but before the
        // rename, the play is still (correctly) in its previous state.
        play.state = new_state;
        self.write_atomic(&from, play)?;

        if from != to {
            fs::rename(&from, &to).map_err(|e| {
                play.state = old_state;
                EngineError::Fatal(format!(
                    "cannot move play {} to {}: {e}",
                    play.id,
                    new_state.dir_name()
                ))
            })?;
        }

        tracing::info!(
            play_id = %play.id,
            from = %old_state,
            to = %new_state,
            "play transitioned"
        );
        Ok(())
    }

    /// Move a broken record out of the live tree with a sidecar describing
    /// why. Quarantined plays are counted by `status` and never acted on.
    pub fn quarantine(&self, play_id: &str, path: &Path, reason: &str) -> Result<()> {
        let qdir = self.root.join(QUARANTINE_DIR);
        let dest = qdir.join(Self::file_name(play_id));
        fs::rename(path, &dest)
            .map_err(|e| EngineError::Fatal(format!("cannot quarantine {play_id}: {e}")))?;
        let sidecar = qdir.join(format!("{play_id}.error"));
        fs::write(&sidecar, reason)
            .map_err(|e| EngineError::Fatal(format!("cannot write sidecar for {play_id}: {e}")))?;
        tracing::error!(play_id, reason, "play quarantined");
        Ok(())
    }

    pub fn quarantine_count(&self) -> usize {
        let qdir = self.root.join(QUARANTINE_DIR);
        fs::read_dir(&qdir).map_or(0, |entries| {
            entries
                .filter_map(std::result::Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
    }

    /// File a terminal play under `archive/YYYY-MM/`.
    pub fn archive(&self, play_id: &str) -> Result<()> {
        let Some((state, path)) = self.locate(play_id) else {
            return Err(EngineError::Validation(format!(
                "play {play_id} not found for archive"
            )));
        };
        if !state.is_terminal() {
            return Err(EngineError::Integrity(format!(
                "play {play_id} in {state} cannot be archived"
            )));
        }

        let month = chrono::Utc::now().format("%Y-%m").to_string();
        let dir = self.root.join(ARCHIVE_DIR).join(month);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Fatal(format!("cannot create archive dir: {e}")))?;
        fs::rename(&path, dir.join(Self::file_name(play_id)))
            .map_err(|e| EngineError::Fatal(format!("cannot archive {play_id}: {e}")))
    }

    /// Per-state play counts, for `status`.
    pub fn counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for state in PlayState::ALL {
            counts.insert(state.dir_name().to_string(), self.list(state)?.len());
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::OptionSide;
    use crate::play::{EntrySpec, OrderPolicy, PositionSide, PriceReference};
    use chrono::NaiveDate;

    fn sample_play() -> Play {
        Play::new(
            "spy-call",
            "swings",
            "SPY",
            OptionSide::Call,
            500.0,
            NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
            PositionSide::Long,
            1,
            EntrySpec {
                target_stock_price: 500.0,
                reference: PriceReference::Last,
                buffer: 0.50,
                order_policy: OrderPolicy::LimitAtAsk,
            },
        )
    }

    fn store() -> (tempfile::TempDir, PlayStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PlayStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn save_load_round_trip() {
        let (_dir, store) = store();
        let play = sample_play();
        store.save(&play).unwrap();
        let loaded = store.load(&play.id).unwrap();
        assert_eq!(loaded, play);
    }

    #[test]
    fn round_trip_preserves_unknown_keys() {
        let (_dir, store) = store();
        let mut play = sample_play();
        play.extra
            .insert("desk_note".into(), serde_json::json!("earnings week"));
        store.save(&play).unwrap();

        let loaded = store.load(&play.id).unwrap();
        assert_eq!(loaded, play);
        store.save(&loaded).unwrap();
        let reloaded = store.load(&play.id).unwrap();
        assert_eq!(
            reloaded.extra.get("desk_note"),
            Some(&serde_json::json!("earnings week"))
        );
    }

    #[test]
    fn play_lives_in_exactly_one_directory() {
        let (_dir, store) = store();
        let mut play = sample_play();
        store.save(&play).unwrap();
        play.order_ids.entry = Some("ord-1".into());
        store.transition(&mut play, PlayState::PendingOpening).unwrap();

        let mut holding = Vec::new();
        for state in PlayState::ALL {
            if store.path_in(state, &play.id).exists() {
                holding.push(state);
            }
        }
        assert_eq!(holding, vec![PlayState::PendingOpening]);
    }

    #[test]
    fn illegal_transition_is_error() {
        let (_dir, store) = store();
        let mut play = sample_play();
        store.save(&play).unwrap();
        let err = store.transition(&mut play, PlayState::Closed).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        assert_eq!(play.state, PlayState::New);
    }

    #[test]
    fn directory_overrides_recorded_state() {
        let (_dir, store) = store();
        let mut play = sample_play();
        // Simulate a crash mid-transition: record says PENDING_OPENING but
        // the file never moved out of new/.
        play.state = PlayState::PendingOpening;
        play.order_ids.entry = Some("ord-1".into());
        store.write_atomic(&store.path_in(PlayState::New, &play.id), &play).unwrap();

        let loaded = store.load(&play.id).unwrap();
        assert_eq!(loaded.state, PlayState::New);
        // The orphan order id survives for reconciliation.
        assert_eq!(loaded.order_ids.entry.as_deref(), Some("ord-1"));
    }

    #[test]
    fn malformed_record_is_quarantined() {
        let (_dir, store) = store();
        let path = store.path_in(PlayState::New, "broken");
        fs::write(&path, "{ not json").unwrap();

        let err = store.load("broken").unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        assert!(!path.exists());
        assert_eq!(store.quarantine_count(), 1);
        // Sidecar records why.
        let sidecar = store.root().join(QUARANTINE_DIR).join("broken.error");
        assert!(fs::read_to_string(sidecar).unwrap().contains("invalid JSON"));
    }

    #[test]
    fn snapshot_skips_bad_records() {
        let (_dir, store) = store();
        let play = sample_play();
        store.save(&play).unwrap();
        fs::write(store.path_in(PlayState::New, "junk"), "nope").unwrap();

        let snapshot = store.snapshot(PlayState::New).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, play.id);
        assert_eq!(store.quarantine_count(), 1);
    }

    #[test]
    fn legacy_record_migrates_on_load() {
        let (_dir, store) = store();
        let record = serde_json::json!({
            "id": "legacy-1",
            "name": "legacy",
            "strategy_tag": "swings",
            "created_at": "2024-03-01T14:30:00Z",
            "state": "NEW",
            "instrument": {
                "symbol": "SPY",
                "occ_symbol": "SPY   250620C00500000",
                "side": "CALL",
                "strike": 500.0,
                "expiration": "2025-06-20"
            },
            "order_action": "BTO",
            "contracts": 1,
            "entry": { "target_stock_price": 500.0, "buffer": 0.5 },
            "tp_price": 3.0
        });
        let path = store.path_in(PlayState::New, "legacy-1");
        fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let play = store.load("legacy-1").unwrap();
        assert_eq!(play.position_side, PositionSide::Long);
        assert_eq!(play.take_profit.premium, Some(3.0));
    }

    #[test]
    fn counts_reflect_directories() {
        let (_dir, store) = store();
        let mut a = sample_play();
        let b = sample_play();
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        a.order_ids.entry = Some("ord-1".into());
        store.transition(&mut a, PlayState::PendingOpening).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts["new"], 1);
        assert_eq!(counts["pending-opening"], 1);
        assert_eq!(counts["open"], 0);
    }

    #[test]
    fn archive_requires_terminal_state() {
        let (_dir, store) = store();
        let play = sample_play();
        store.save(&play).unwrap();
        assert!(store.archive(&play.id).is_err());
    }

    #[test]
    fn archive_moves_terminal_play() {
        let (_dir, store) = store();
        let mut play = sample_play();
        play.order_ids.entry = Some("ord-1".into());
        store.save(&play).unwrap();
        store.transition(&mut play, PlayState::PendingOpening).unwrap();
        store.transition(&mut play, PlayState::Expired).unwrap();

        store.archive(&play.id).unwrap();
        assert!(store.locate(&play.id).is_none());
        assert_eq!(store.counts().unwrap()["expired"], 0);
    }

    #[test]
    fn tmp_files_are_not_listed() {
        let (_dir, store) = store();
        let play = sample_play();
        store.save(&play).unwrap();
        fs::write(
            store.root().join("new").join("leftover.json.tmp"),
            "partial",
        )
        .unwrap();
        let ids = store.list(PlayState::New).unwrap();
        assert_eq!(ids, vec![play.id.clone()]);
    }
}
