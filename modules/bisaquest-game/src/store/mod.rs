// GameStore is the row-store boundary for everything the game services touch.
//
// PgGameStore is the production implementation. MemoryStore (testing.rs)
// backs unit and integration tests without a database.

mod postgres;

pub use postgres::PgGameStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use bisaquest_common::{
    ChallengeAttempt, ChallengeItem, Environment, EnvironmentProgressRow, NewChallengeAttempt,
    NpcProgressRow, Result,
};

use crate::progress::EnvironmentRecalc;

/// Everything one accepted submission wrote.
#[derive(Debug, Clone)]
pub struct SubmissionWrite {
    pub attempt: ChallengeAttempt,
    pub npc: NpcProgressRow,
    pub environment: EnvironmentRecalc,
}

#[async_trait]
pub trait GameStore: Send + Sync {
    // --- NPC content ---

    /// Environment an NPC lives in, or `None` for an unknown NPC.
    async fn npc_environment(&self, npc_id: &str) -> Result<Option<Environment>>;

    // --- Submissions ---

    /// Apply one challenge result as a single unit: append the attempt, credit the
    /// NPC (encounters saturate at `MAX_ENCOUNTERS`, best score only goes up,
    /// completion is sticky), recalculate `env`, unlock the next environment at
    /// 100%, and mirror the result into the progress blob. Either every write
    /// lands or none does.
    async fn record_submission(
        &self,
        attempt: &NewChallengeAttempt,
        env: Environment,
    ) -> Result<SubmissionWrite>;

    // --- Per-player environment progress ---

    /// Count the player's completed NPCs in `env`, store exactly
    /// `completion_percentage(completed, total)`, and unlock the next environment
    /// when it reaches 100%. A stored unlock is never cleared.
    async fn recalc_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentRecalc>;

    /// Mark an environment unlocked, creating it at 0% if the player has no row yet.
    async fn unlock_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentProgressRow>;

    /// Every environment row the player has.
    async fn environment_rows(&self, player_id: Uuid) -> Result<Vec<EnvironmentProgressRow>>;

    // --- Attempts ---

    /// Attempt history, newest first, optionally narrowed to one quest.
    async fn attempts(
        &self,
        player_id: Uuid,
        quest_id: Option<&str>,
    ) -> Result<Vec<ChallengeAttempt>>;

    // --- Challenge content ---

    async fn challenge_items(&self, quest_id: &str) -> Result<Vec<ChallengeItem>>;

    // --- Progress blob ---

    /// The player's progress blob, or `None` if the player has no row.
    async fn player_progress(&self, player_id: Uuid) -> Result<Option<Value>>;

    /// Merge `patch` into the player's blob (see `progress::merge_progress`) as one
    /// atomic read-modify-write, creating the player row if needed. Environments
    /// the merged blob unlocks get a stored unlock in the same write. Returns the
    /// merged blob.
    async fn merge_player_progress(&self, player_id: Uuid, patch: &Value) -> Result<Value>;

    /// Clear the blob and all NPC/environment progress. The attempt log is kept.
    async fn reset_player(&self, player_id: Uuid) -> Result<()>;
}
