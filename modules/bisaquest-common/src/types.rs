use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BisaQuestError;

/// An NPC stops counting encounters after this many.
pub const MAX_ENCOUNTERS: i32 = 3;

/// Items shown per challenge round unless configured otherwise.
pub const DEFAULT_ROUND_SIZE: usize = 4;

// --- Environments ---

/// A themed game zone. Environments unlock in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Village,
    Forest,
    Castle,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Village, Environment::Forest, Environment::Castle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Village => "village",
            Environment::Forest => "forest",
            Environment::Castle => "castle",
        }
    }

    /// The environment that unlocks once this one is fully completed.
    pub fn next(&self) -> Option<Environment> {
        match self {
            Environment::Village => Some(Environment::Forest),
            Environment::Forest => Some(Environment::Castle),
            Environment::Castle => None,
        }
    }

    /// Blob key holding this environment's percentage, e.g. `village_progress`.
    pub fn progress_key(&self) -> String {
        format!("{}_progress", self.as_str())
    }

    /// Blob key holding this environment's per-NPC completions, e.g. `village_npcs`.
    pub fn npcs_key(&self) -> String {
        format!("{}_npcs", self.as_str())
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = BisaQuestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "village" => Ok(Environment::Village),
            "forest" => Ok(Environment::Forest),
            "castle" => Ok(Environment::Castle),
            other => Err(BisaQuestError::validation(format!("unknown environment: {other}"))),
        }
    }
}

// --- Player progress ---

/// One NPC's entry in a player's progress blob (`<env>_npcs.<npc_id>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpcCompletion {
    #[serde(default)]
    pub encounters: i32,
    #[serde(default)]
    pub best_score: i32,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A row of `player_npc_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcProgressRow {
    pub player_id: Uuid,
    pub npc_id: String,
    pub encounters: i32,
    pub best_score: i32,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NpcProgressRow {
    pub fn completion(&self) -> NpcCompletion {
        NpcCompletion {
            encounters: self.encounters,
            best_score: self.best_score,
            is_completed: self.is_completed,
            completed_at: self.completed_at,
        }
    }
}

/// A row of `player_environment_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentProgressRow {
    pub player_id: Uuid,
    pub environment: Environment,
    pub progress_percentage: i32,
    pub is_completed: bool,
    pub unlocked: bool,
    pub updated_at: DateTime<Utc>,
}

// --- Challenge content ---

/// A draggable item in a quest round. Authored content, never written at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeItem {
    pub item_id: Uuid,
    pub quest_id: String,
    pub label: String,
    pub correct_zone: String,
    pub is_correct: bool,
    pub round_number: i32,
    pub display_order: i32,
}

/// A row of the append-only `player_quest_attempts` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeAttempt {
    pub id: Uuid,
    pub player_id: Uuid,
    pub quest_id: String,
    pub npc_id: String,
    pub score: i32,
    pub max_score: i32,
    pub passed: bool,
    pub attempted_at: DateTime<Utc>,
}

/// Parameters for appending a challenge attempt.
#[derive(Debug, Clone)]
pub struct NewChallengeAttempt {
    pub player_id: Uuid,
    pub quest_id: String,
    pub npc_id: String,
    pub score: i32,
    pub max_score: i32,
    pub passed: bool,
    pub attempted_at: DateTime<Utc>,
}
