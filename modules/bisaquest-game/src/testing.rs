// Test double for the game services.
//
// MemoryStore implements GameStore over HashMaps behind one Mutex, with the
// same rules as the Postgres store: sticky completions and unlocks, exact
// percentages, saturating encounter counts. Multi-step operations run against
// a staged copy that replaces the live state only when every step succeeds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use bisaquest_common::{
    BisaQuestError, ChallengeAttempt, ChallengeItem, Environment, EnvironmentProgressRow,
    NewChallengeAttempt, NpcProgressRow, Result, MAX_ENCOUNTERS,
};

use crate::progress::{
    completion_percentage, granted_unlocks, merge_progress, progress_patch, EnvironmentRecalc,
};
use crate::store::{GameStore, SubmissionWrite};

#[derive(Default, Clone)]
struct MemoryStoreInner {
    npcs: HashMap<String, Environment>,
    npc_progress: HashMap<(Uuid, String), NpcProgressRow>,
    environments: HashMap<(Uuid, Environment), EnvironmentProgressRow>,
    attempts: Vec<ChallengeAttempt>,
    items: Vec<ChallengeItem>,
    players: HashMap<Uuid, Value>,
    /// Writes left before every further write fails. `None` is unlimited.
    write_budget: Option<usize>,
}

/// Stateful in-memory row-store. Builder methods seed content and players.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_npc(self, npc_id: &str, env: Environment) -> Self {
        self.add_npc(npc_id, env);
        self
    }

    /// Seed `count` NPCs named `<env>_npc_<n>`, numbered from 1.
    pub fn with_npcs(self, env: Environment, count: usize) -> Self {
        for n in 1..=count {
            self.add_npc(&format!("{env}_npc_{n}"), env);
        }
        self
    }

    /// Author another NPC after the store is in use.
    pub fn add_npc(&self, npc_id: &str, env: Environment) {
        self.inner.lock().unwrap().npcs.insert(npc_id.to_string(), env);
    }

    pub fn with_items(self, items: Vec<ChallengeItem>) -> Self {
        self.inner.lock().unwrap().items.extend(items);
        self
    }

    pub fn with_player(self, player_id: Uuid, progress: Value) -> Self {
        self.inner.lock().unwrap().players.insert(player_id, progress);
        self
    }

    /// Mark an NPC completed for a player, as if an earlier submission passed.
    pub fn with_completed_npc(self, player_id: Uuid, npc_id: &str) -> Self {
        self.inner.lock().unwrap().npc_progress.insert(
            (player_id, npc_id.to_string()),
            NpcProgressRow {
                player_id,
                npc_id: npc_id.to_string(),
                encounters: 1,
                best_score: 0,
                is_completed: true,
                completed_at: Some(Utc::now()),
            },
        );
        self
    }

    /// Make every write return a persistence error.
    pub fn failing_writes(self) -> Self {
        self.failing_after(0)
    }

    /// Let `writes` row writes succeed, then fail every later one. A failed
    /// operation is rolled back and does not use up the budget.
    pub fn failing_after(self, writes: usize) -> Self {
        self.inner.lock().unwrap().write_budget = Some(writes);
        self
    }

    // --- Assertion helpers ---

    pub fn environment_row(&self, player_id: Uuid, env: Environment) -> Option<EnvironmentProgressRow> {
        self.inner.lock().unwrap().environments.get(&(player_id, env)).cloned()
    }

    pub fn npc_row(&self, player_id: Uuid, npc_id: &str) -> Option<NpcProgressRow> {
        self.inner
            .lock()
            .unwrap()
            .npc_progress
            .get(&(player_id, npc_id.to_string()))
            .cloned()
    }

    pub fn attempts_logged(&self) -> usize {
        self.inner.lock().unwrap().attempts.len()
    }

    pub fn blob(&self, player_id: Uuid) -> Option<Value> {
        self.inner.lock().unwrap().players.get(&player_id).cloned()
    }

    /// Run `f` on a copy of the state and keep the copy only if `f` succeeds.
    fn transaction<T>(&self, f: impl FnOnce(&mut MemoryStoreInner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        let mut staged = inner.clone();
        let out = f(&mut staged)?;
        *inner = staged;
        Ok(out)
    }
}

impl MemoryStoreInner {
    fn write(&mut self) -> Result<()> {
        match self.write_budget.as_mut() {
            Some(0) => Err(BisaQuestError::Persistence("memory store rejected write".into())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn insert_attempt(&mut self, attempt: &NewChallengeAttempt) -> Result<ChallengeAttempt> {
        self.write()?;
        let stored = ChallengeAttempt {
            id: Uuid::new_v4(),
            player_id: attempt.player_id,
            quest_id: attempt.quest_id.clone(),
            npc_id: attempt.npc_id.clone(),
            score: attempt.score,
            max_score: attempt.max_score,
            passed: attempt.passed,
            attempted_at: attempt.attempted_at,
        };
        self.attempts.push(stored.clone());
        Ok(stored)
    }

    fn record_npc_result(&mut self, attempt: &NewChallengeAttempt) -> Result<NpcProgressRow> {
        self.write()?;
        let (score, passed, at) = (attempt.score, attempt.passed, attempt.attempted_at);
        let row = self
            .npc_progress
            .entry((attempt.player_id, attempt.npc_id.clone()))
            .and_modify(|row| {
                row.encounters = (row.encounters + 1).min(MAX_ENCOUNTERS);
                row.best_score = row.best_score.max(score);
                if passed && !row.is_completed {
                    row.is_completed = true;
                    row.completed_at = Some(at);
                }
            })
            .or_insert_with(|| NpcProgressRow {
                player_id: attempt.player_id,
                npc_id: attempt.npc_id.clone(),
                encounters: 1,
                best_score: score,
                is_completed: passed,
                completed_at: passed.then_some(at),
            });
        Ok(row.clone())
    }

    fn recalc_environment(
        &mut self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentRecalc> {
        self.write()?;
        let total = self.npcs.values().filter(|e| **e == env).count() as u32;
        let completed = self
            .npc_progress
            .values()
            .filter(|row| row.player_id == player_id && row.is_completed)
            .filter(|row| self.npcs.get(&row.npc_id) == Some(&env))
            .count() as u32;
        let percentage = i32::from(completion_percentage(completed, total));

        let row = self
            .environments
            .entry((player_id, env))
            .and_modify(|row| {
                row.progress_percentage = percentage;
                row.is_completed = percentage == 100;
                row.updated_at = at;
            })
            .or_insert_with(|| EnvironmentProgressRow {
                player_id,
                environment: env,
                progress_percentage: percentage,
                is_completed: percentage == 100,
                unlocked: env == Environment::Village,
                updated_at: at,
            });
        let recalc = EnvironmentRecalc::from_row(row);

        if let Some(next) = recalc.unlocked_next {
            self.unlock_environment(player_id, next, at)?;
        }
        Ok(recalc)
    }

    fn unlock_environment(
        &mut self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentProgressRow> {
        self.write()?;
        let row = self
            .environments
            .entry((player_id, env))
            .and_modify(|row| row.unlocked = true)
            .or_insert_with(|| EnvironmentProgressRow {
                player_id,
                environment: env,
                progress_percentage: 0,
                is_completed: false,
                unlocked: true,
                updated_at: at,
            });
        Ok(row.clone())
    }

    fn environment_rows(&self, player_id: Uuid) -> Vec<EnvironmentProgressRow> {
        let mut rows: Vec<_> = self
            .environments
            .values()
            .filter(|row| row.player_id == player_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.environment);
        rows
    }

    fn merge_blob(&mut self, player_id: Uuid, patch: &Value, at: DateTime<Utc>) -> Result<Value> {
        self.write()?;
        let blob = self.players.entry(player_id).or_insert_with(|| json!({}));
        *blob = merge_progress(blob, patch);
        let merged = blob.clone();

        let rows = self.environment_rows(player_id);
        for env in granted_unlocks(&merged, &rows) {
            self.unlock_environment(player_id, env, at)?;
        }
        Ok(merged)
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn npc_environment(&self, npc_id: &str) -> Result<Option<Environment>> {
        Ok(self.inner.lock().unwrap().npcs.get(npc_id).copied())
    }

    async fn record_submission(
        &self,
        attempt: &NewChallengeAttempt,
        env: Environment,
    ) -> Result<SubmissionWrite> {
        self.transaction(|inner| {
            let stored = inner.insert_attempt(attempt)?;
            let npc = inner.record_npc_result(attempt)?;
            let environment =
                inner.recalc_environment(attempt.player_id, env, attempt.attempted_at)?;
            let patch =
                progress_patch(env, environment.percentage, &npc.npc_id, &npc.completion());
            inner.merge_blob(attempt.player_id, &patch, attempt.attempted_at)?;
            Ok(SubmissionWrite {
                attempt: stored,
                npc,
                environment,
            })
        })
    }

    async fn recalc_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentRecalc> {
        self.transaction(|inner| inner.recalc_environment(player_id, env, at))
    }

    async fn unlock_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentProgressRow> {
        self.transaction(|inner| inner.unlock_environment(player_id, env, at))
    }

    async fn environment_rows(&self, player_id: Uuid) -> Result<Vec<EnvironmentProgressRow>> {
        Ok(self.inner.lock().unwrap().environment_rows(player_id))
    }

    async fn attempts(
        &self,
        player_id: Uuid,
        quest_id: Option<&str>,
    ) -> Result<Vec<ChallengeAttempt>> {
        let inner = self.inner.lock().unwrap();
        // Newest first; ties keep the later insert first.
        Ok(inner
            .attempts
            .iter()
            .rev()
            .filter(|a| a.player_id == player_id)
            .filter(|a| quest_id.map_or(true, |q| a.quest_id == q))
            .cloned()
            .collect())
    }

    async fn challenge_items(&self, quest_id: &str) -> Result<Vec<ChallengeItem>> {
        let inner = self.inner.lock().unwrap();
        let mut items: Vec<_> = inner
            .items
            .iter()
            .filter(|i| i.quest_id == quest_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.round_number, i.display_order));
        Ok(items)
    }

    async fn player_progress(&self, player_id: Uuid) -> Result<Option<Value>> {
        Ok(self.inner.lock().unwrap().players.get(&player_id).cloned())
    }

    async fn merge_player_progress(&self, player_id: Uuid, patch: &Value) -> Result<Value> {
        self.transaction(|inner| inner.merge_blob(player_id, patch, Utc::now()))
    }

    async fn reset_player(&self, player_id: Uuid) -> Result<()> {
        self.transaction(|inner| {
            inner.write()?;
            match inner.players.get_mut(&player_id) {
                Some(blob) => *blob = json!({}),
                None => return Err(BisaQuestError::not_found(format!("player {player_id}"))),
            }
            inner.npc_progress.retain(|(player, _), _| *player != player_id);
            inner.environments.retain(|(player, _), _| *player != player_id);
            Ok(())
        })
    }
}
