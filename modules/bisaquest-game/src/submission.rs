use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use bisaquest_common::{
    BisaQuestError, ChallengeAttempt, NewChallengeAttempt, NpcProgressRow, Result,
};

use crate::progress::EnvironmentRecalc;
use crate::store::GameStore;

/// Body of `POST /api/challenge/quest/submit`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAttempt {
    pub player_id: Uuid,
    pub quest_id: String,
    pub npc_id: String,
    pub score: i32,
    pub max_score: i32,
    pub passed: bool,
}

impl SubmitAttempt {
    pub fn validate(&self) -> Result<()> {
        if self.quest_id.trim().is_empty() {
            return Err(BisaQuestError::validation("questId is required"));
        }
        if self.npc_id.trim().is_empty() {
            return Err(BisaQuestError::validation("npcId is required"));
        }
        if self.max_score <= 0 {
            return Err(BisaQuestError::validation("maxScore must be positive"));
        }
        if self.score < 0 || self.score > self.max_score {
            return Err(BisaQuestError::validation(format!(
                "score must be between 0 and {}",
                self.max_score
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub attempt: ChallengeAttempt,
    pub npc: NpcProgressRow,
    pub environment: EnvironmentRecalc,
}

/// Log a challenge attempt, credit the NPC, and recompute the NPC's environment.
///
/// The player's progress blob receives the new percentage and the NPC's
/// completion so clients reading the blob see the same state. All writes land
/// together or not at all.
pub async fn submit_quest_attempt(
    store: &dyn GameStore,
    request: SubmitAttempt,
) -> Result<SubmissionOutcome> {
    request.validate()?;

    let environment = store
        .npc_environment(&request.npc_id)
        .await?
        .ok_or_else(|| BisaQuestError::not_found(format!("NPC {}", request.npc_id)))?;

    let write = store
        .record_submission(
            &NewChallengeAttempt {
                player_id: request.player_id,
                quest_id: request.quest_id.clone(),
                npc_id: request.npc_id.clone(),
                score: request.score,
                max_score: request.max_score,
                passed: request.passed,
                attempted_at: Utc::now(),
            },
            environment,
        )
        .await?;

    info!(
        player_id = %request.player_id,
        quest_id = %request.quest_id,
        npc_id = %request.npc_id,
        passed = request.passed,
        environment = %environment,
        percentage = write.environment.percentage,
        "Quest attempt submitted"
    );
    if let Some(next) = write.environment.unlocked_next {
        info!(player_id = %request.player_id, completed = %environment, unlocked = %next, "Environment unlocked");
    }

    Ok(SubmissionOutcome {
        attempt: write.attempt,
        npc: write.npc,
        environment: write.environment,
    })
}
