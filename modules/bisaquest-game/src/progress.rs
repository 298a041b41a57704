//! Environment progress: completion percentages, unlock rules, and the
//! merge policy for the per-player progress blob.
//!
//! The blob (`players.progress_data`) mirrors what the game client reads:
//! `<env>_progress` percentages plus `<env>_npcs` completion maps. The
//! `player_environment_progress` rows are the server's own record; readers
//! fold both together so an unlock recorded in either place is never lost.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use bisaquest_common::{
    BisaQuestError, Environment, EnvironmentProgressRow, NpcCompletion, Result,
};

use crate::store::GameStore;

/// An environment counts as done (and unlocks the next) only at exactly this.
pub const COMPLETE_PERCENTAGE: u8 = 100;

/// `round(100 * completed / total)`, rounding halves up. Zero NPCs yields 0.
pub fn completion_percentage(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = u64::from(completed.min(total));
    let total = u64::from(total);
    ((completed * 200 + total) / (total * 2)) as u8
}

// --- Blob merge ---

/// Keys whose values are `npc_id → completion` maps and merge per NPC.
fn is_completion_map_key(key: &str) -> bool {
    key == "npc_completions" || key.ends_with("_npcs")
}

/// Merge a partial update into a progress blob.
///
/// Top-level keys are replaced by the patch, except completion maps, which are
/// merged NPC by NPC so completions the patch doesn't mention survive.
pub fn merge_progress(existing: &Value, patch: &Value) -> Value {
    let mut merged = existing.as_object().cloned().unwrap_or_default();
    let Some(patch) = patch.as_object() else {
        return Value::Object(merged);
    };

    for (key, value) in patch {
        if is_completion_map_key(key) {
            if let (Some(Value::Object(current)), Value::Object(incoming)) =
                (merged.get_mut(key), value)
            {
                for (npc_id, completion) in incoming {
                    current.insert(npc_id.clone(), completion.clone());
                }
                continue;
            }
        }
        merged.insert(key.clone(), value.clone());
    }

    Value::Object(merged)
}

// --- Unlock predicate ---

/// Per-environment percentages as seen by a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub village: f64,
    pub forest: f64,
    pub castle: f64,
}

impl ProgressSnapshot {
    /// Read `<env>_progress` keys. Missing or unparseable values count as 0.
    pub fn from_blob(blob: &Value) -> Self {
        let mut snapshot = Self::default();
        for env in Environment::ALL {
            snapshot.set(env, read_percentage(blob.get(env.progress_key())));
        }
        snapshot
    }

    /// Fold in stored environment rows, keeping the higher value per environment.
    pub fn with_rows(mut self, rows: &[EnvironmentProgressRow]) -> Self {
        for row in rows {
            let stored = f64::from(row.progress_percentage);
            if stored > self.get(row.environment) {
                self.set(row.environment, stored);
            }
        }
        self
    }

    pub fn get(&self, env: Environment) -> f64 {
        match env {
            Environment::Village => self.village,
            Environment::Forest => self.forest,
            Environment::Castle => self.castle,
        }
    }

    fn set(&mut self, env: Environment, value: f64) {
        match env {
            Environment::Village => self.village = value,
            Environment::Forest => self.forest = value,
            Environment::Castle => self.castle = value,
        }
    }

    fn is_complete(&self, env: Environment) -> bool {
        self.get(env) >= f64::from(COMPLETE_PERCENTAGE)
    }
}

fn read_percentage(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Village is always open; each later environment needs every earlier one at 100%.
pub fn is_unlocked(env: Environment, snapshot: &ProgressSnapshot) -> bool {
    match env {
        Environment::Village => true,
        Environment::Forest => snapshot.is_complete(Environment::Village),
        Environment::Castle => {
            snapshot.is_complete(Environment::Village) && snapshot.is_complete(Environment::Forest)
        }
    }
}

// --- Read models ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentView {
    pub environment: Environment,
    pub progress: u8,
    pub completed: bool,
    pub unlocked: bool,
    pub npcs: BTreeMap<String, NpcCompletion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LobbyEntry {
    pub progress: u8,
    pub completed: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LobbyView {
    pub village: LobbyEntry,
    pub forest: LobbyEntry,
    pub castle: LobbyEntry,
}

fn display_percentage(value: f64) -> u8 {
    value.round().clamp(0.0, f64::from(COMPLETE_PERCENTAGE)) as u8
}

fn unlocked_with_rows(
    env: Environment,
    snapshot: &ProgressSnapshot,
    rows: &[EnvironmentProgressRow],
) -> bool {
    is_unlocked(env, snapshot) || rows.iter().any(|r| r.environment == env && r.unlocked)
}

/// Completion entries from `<env>_npcs`. Entries that don't parse are skipped.
fn npc_completions(blob: &Value, env: Environment) -> BTreeMap<String, NpcCompletion> {
    blob.get(env.npcs_key())
        .and_then(Value::as_object)
        .map(|npcs| {
            npcs.iter()
                .filter_map(|(npc_id, raw)| {
                    serde_json::from_value(raw.clone())
                        .ok()
                        .map(|c| (npc_id.clone(), c))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn environment_view(
    env: Environment,
    blob: &Value,
    rows: &[EnvironmentProgressRow],
) -> EnvironmentView {
    let snapshot = ProgressSnapshot::from_blob(blob).with_rows(rows);
    EnvironmentView {
        environment: env,
        progress: display_percentage(snapshot.get(env)),
        completed: snapshot.is_complete(env),
        unlocked: unlocked_with_rows(env, &snapshot, rows),
        npcs: npc_completions(blob, env),
    }
}

pub fn lobby_view(blob: &Value, rows: &[EnvironmentProgressRow]) -> LobbyView {
    let snapshot = ProgressSnapshot::from_blob(blob).with_rows(rows);
    let entry = |env: Environment| LobbyEntry {
        progress: display_percentage(snapshot.get(env)),
        completed: snapshot.is_complete(env),
        locked: !unlocked_with_rows(env, &snapshot, rows),
    };
    LobbyView {
        village: entry(Environment::Village),
        forest: entry(Environment::Forest),
        castle: entry(Environment::Castle),
    }
}

/// Environments after the village that the merged blob and rows unlock but
/// that have no stored unlock yet. Stores persist these so a later write that
/// lowers a percentage cannot lock them again.
pub(crate) fn granted_unlocks(blob: &Value, rows: &[EnvironmentProgressRow]) -> Vec<Environment> {
    let snapshot = ProgressSnapshot::from_blob(blob).with_rows(rows);
    Environment::ALL
        .into_iter()
        .filter(|env| *env != Environment::Village)
        .filter(|env| is_unlocked(*env, &snapshot))
        .filter(|env| !rows.iter().any(|r| r.environment == *env && r.unlocked))
        .collect()
}

/// Blob patch recording one environment's percentage and one NPC's completion.
pub fn progress_patch(
    env: Environment,
    percentage: u8,
    npc_id: &str,
    completion: &NpcCompletion,
) -> Value {
    let mut entry = Map::new();
    entry.insert("encounters".into(), Value::from(completion.encounters));
    entry.insert("best_score".into(), Value::from(completion.best_score));
    entry.insert("is_completed".into(), Value::from(completion.is_completed));
    if let Some(at) = completion.completed_at {
        entry.insert(
            "completed_at".into(),
            Value::from(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }

    let mut npcs = Map::new();
    npcs.insert(npc_id.to_string(), Value::Object(entry));

    let mut patch = Map::new();
    patch.insert(env.progress_key(), Value::from(percentage));
    patch.insert(env.npcs_key(), Value::Object(npcs));
    Value::Object(patch)
}

// --- Recalculation ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentRecalc {
    pub environment: Environment,
    pub percentage: u8,
    pub is_completed: bool,
    /// Set when this recalculation completed the environment and opened the next one.
    pub unlocked_next: Option<Environment>,
}

impl EnvironmentRecalc {
    /// Describe a freshly stored environment row. `unlocked_next` is set when the
    /// row is complete and a later environment exists.
    pub fn from_row(row: &EnvironmentProgressRow) -> Self {
        let percentage = u8::try_from(row.progress_percentage.clamp(0, 100)).unwrap_or(0);
        let is_completed = percentage == COMPLETE_PERCENTAGE;
        Self {
            environment: row.environment,
            percentage,
            is_completed,
            unlocked_next: if is_completed { row.environment.next() } else { None },
        }
    }
}

/// Recompute the percentage of the environment `npc_id` belongs to and persist it.
/// Reaching 100% unlocks the next environment in the same store write.
pub async fn recalc_environment_progress(
    store: &dyn GameStore,
    player_id: Uuid,
    npc_id: &str,
) -> Result<EnvironmentRecalc> {
    let environment = store
        .npc_environment(npc_id)
        .await?
        .ok_or_else(|| BisaQuestError::not_found(format!("NPC {npc_id}")))?;

    let recalc = store
        .recalc_environment(player_id, environment, Utc::now())
        .await?;
    debug!(%player_id, %environment, percentage = recalc.percentage, "Environment progress recalculated");

    if let Some(next) = recalc.unlocked_next {
        info!(%player_id, completed = %environment, unlocked = %next, "Environment unlocked");
    }
    Ok(recalc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn row(env: Environment, pct: i32, unlocked: bool) -> EnvironmentProgressRow {
        EnvironmentProgressRow {
            player_id: Uuid::nil(),
            environment: env,
            progress_percentage: pct,
            is_completed: pct >= 100,
            unlocked,
            updated_at: Utc::now(),
        }
    }

    // --- completion_percentage ---

    #[test]
    fn percentage_rounds_to_nearest() {
        assert_eq!(completion_percentage(2, 3), 67);
        assert_eq!(completion_percentage(1, 3), 33);
        assert_eq!(completion_percentage(3, 3), 100);
    }

    #[test]
    fn percentage_rounds_half_up() {
        assert_eq!(completion_percentage(1, 8), 13);
        assert_eq!(completion_percentage(1, 200), 1);
    }

    #[test]
    fn percentage_with_no_npcs_is_zero() {
        assert_eq!(completion_percentage(0, 0), 0);
        assert_eq!(completion_percentage(4, 0), 0);
    }

    #[test]
    fn percentage_never_exceeds_hundred() {
        assert_eq!(completion_percentage(5, 3), 100);
    }

    #[test]
    fn percentage_matches_formula_for_small_environments() {
        for total in 1..=12u32 {
            for completed in 0..=total {
                let expected = (100.0 * completed as f64 / total as f64).round() as u8;
                assert_eq!(completion_percentage(completed, total), expected, "{completed}/{total}");
            }
        }
    }

    // --- merge_progress ---

    #[test]
    fn merge_replaces_scalar_keys() {
        let existing = json!({"village_progress": 33, "nickname": "Tala"});
        let merged = merge_progress(&existing, &json!({"village_progress": 67}));
        assert_eq!(merged, json!({"village_progress": 67, "nickname": "Tala"}));
    }

    #[test]
    fn merge_keeps_completions_the_patch_omits() {
        let existing = json!({
            "village_npcs": {
                "nanay_rosa": {"encounters": 2, "best_score": 5, "is_completed": true}
            }
        });
        let patch = json!({
            "village_npcs": {
                "mang_pedro": {"encounters": 1, "best_score": 3, "is_completed": false}
            }
        });
        let merged = merge_progress(&existing, &patch);
        assert_eq!(merged["village_npcs"]["nanay_rosa"]["is_completed"], json!(true));
        assert_eq!(merged["village_npcs"]["mang_pedro"]["best_score"], json!(3));
    }

    #[test]
    fn merge_patch_wins_per_npc() {
        let existing = json!({"npc_completions": {"a": {"encounters": 1}}});
        let merged = merge_progress(&existing, &json!({"npc_completions": {"a": {"encounters": 2}}}));
        assert_eq!(merged["npc_completions"]["a"], json!({"encounters": 2}));
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = json!({"village_progress": 33, "village_npcs": {"a": {"is_completed": true}}});
        let patch = json!({"village_progress": 67, "village_npcs": {"b": {"is_completed": true}}});
        let once = merge_progress(&existing, &patch);
        let twice = merge_progress(&once, &patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_into_missing_blob_starts_empty() {
        let merged = merge_progress(&Value::Null, &json!({"forest_progress": 10}));
        assert_eq!(merged, json!({"forest_progress": 10}));
    }

    #[test]
    fn merge_replaces_completion_map_that_was_not_an_object() {
        let merged = merge_progress(&json!({"forest_npcs": null}), &json!({"forest_npcs": {"x": {}}}));
        assert_eq!(merged, json!({"forest_npcs": {"x": {}}}));
    }

    // --- unlock predicate ---

    #[test]
    fn village_is_always_unlocked() {
        assert!(is_unlocked(Environment::Village, &ProgressSnapshot::default()));
    }

    #[test]
    fn forest_unlocked_castle_locked_midway_through_forest() {
        let snapshot = ProgressSnapshot::from_blob(&json!({"village_progress": 100, "forest_progress": 40}));
        assert!(is_unlocked(Environment::Forest, &snapshot));
        assert!(!is_unlocked(Environment::Castle, &snapshot));
    }

    #[test]
    fn ninety_nine_percent_does_not_unlock() {
        let snapshot = ProgressSnapshot::from_blob(&json!({"village_progress": 99.9}));
        assert!(!is_unlocked(Environment::Forest, &snapshot));
    }

    #[test]
    fn castle_needs_both_earlier_environments() {
        let snapshot = ProgressSnapshot::from_blob(&json!({"village_progress": 40, "forest_progress": 100}));
        assert!(!is_unlocked(Environment::Castle, &snapshot));
        let snapshot = ProgressSnapshot::from_blob(&json!({"village_progress": "100", "forest_progress": 100}));
        assert!(is_unlocked(Environment::Castle, &snapshot));
    }

    #[test]
    fn stored_rows_raise_blob_percentages() {
        let snapshot = ProgressSnapshot::from_blob(&json!({"village_progress": 67}))
            .with_rows(&[row(Environment::Village, 100, true)]);
        assert_eq!(snapshot.village, 100.0);
        assert!(is_unlocked(Environment::Forest, &snapshot));
    }

    #[test]
    fn stored_rows_never_lower_blob_percentages() {
        let snapshot = ProgressSnapshot::from_blob(&json!({"forest_progress": 80}))
            .with_rows(&[row(Environment::Forest, 20, true)]);
        assert_eq!(snapshot.forest, 80.0);
    }

    // --- views ---

    #[test]
    fn stored_unlock_survives_blob_regression() {
        // The blob was rewritten by the client, but the forest was already unlocked.
        let blob = json!({"village_progress": 50});
        let rows = [row(Environment::Forest, 0, true)];
        let view = environment_view(Environment::Forest, &blob, &rows);
        assert!(view.unlocked);
        assert_eq!(view.progress, 0);
    }

    #[test]
    fn environment_view_lists_parseable_npcs() {
        let blob = json!({
            "forest_progress": 50,
            "forest_npcs": {
                "diwata": {"encounters": 3, "best_score": 8, "is_completed": true},
                "broken": "not an object"
            }
        });
        let view = environment_view(Environment::Forest, &blob, &[]);
        assert_eq!(view.progress, 50);
        assert!(!view.unlocked);
        assert_eq!(view.npcs.len(), 1);
        assert!(view.npcs["diwata"].is_completed);
    }

    #[test]
    fn lobby_applies_predicate_to_every_environment() {
        let lobby = lobby_view(&json!({"village_progress": 100, "forest_progress": 40}), &[]);
        assert!(lobby.village.completed);
        assert!(!lobby.village.locked);
        assert!(!lobby.forest.locked);
        assert_eq!(lobby.forest.progress, 40);
        assert!(lobby.castle.locked);
    }

    #[test]
    fn progress_patch_targets_environment_keys() {
        let completion = NpcCompletion {
            encounters: 1,
            best_score: 4,
            is_completed: true,
            completed_at: None,
        };
        let patch = progress_patch(Environment::Village, 100, "lola_nena", &completion);
        assert_eq!(patch["village_progress"], json!(100));
        assert_eq!(patch["village_npcs"]["lola_nena"]["best_score"], json!(4));
    }

    #[test]
    fn progress_patch_carries_completion_time() {
        let at = chrono::DateTime::parse_from_rfc3339("2025-03-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let completion = NpcCompletion {
            encounters: 2,
            best_score: 5,
            is_completed: true,
            completed_at: Some(at),
        };
        let patch = progress_patch(Environment::Forest, 50, "diwata", &completion);
        let entry = &patch["forest_npcs"]["diwata"];
        assert_eq!(entry["completed_at"], json!("2025-03-01T08:30:00Z"));
        let parsed: NpcCompletion = serde_json::from_value(entry.clone()).unwrap();
        assert_eq!(parsed, completion);
    }

    // --- granted unlocks ---

    #[test]
    fn complete_village_grants_forest_only() {
        let granted = granted_unlocks(&json!({"village_progress": 100}), &[]);
        assert_eq!(granted, vec![Environment::Forest]);
    }

    #[test]
    fn stored_unlocks_are_not_granted_again() {
        let blob = json!({"village_progress": 100, "forest_progress": 100});
        let rows = [row(Environment::Forest, 100, true)];
        assert_eq!(granted_unlocks(&blob, &rows), vec![Environment::Castle]);
    }

    #[test]
    fn incomplete_blob_grants_nothing() {
        assert!(granted_unlocks(&json!({"village_progress": 99}), &[]).is_empty());
    }

    // --- recalc rows ---

    #[test]
    fn complete_row_reports_next_environment() {
        let recalc = EnvironmentRecalc::from_row(&row(Environment::Village, 100, true));
        assert!(recalc.is_completed);
        assert_eq!(recalc.unlocked_next, Some(Environment::Forest));

        let recalc = EnvironmentRecalc::from_row(&row(Environment::Castle, 100, true));
        assert_eq!(recalc.unlocked_next, None);

        let recalc = EnvironmentRecalc::from_row(&row(Environment::Forest, 50, true));
        assert_eq!(recalc.percentage, 50);
        assert_eq!(recalc.unlocked_next, None);
    }
}
