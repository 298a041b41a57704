// Postgres implementation of GameStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use bisaquest_common::{
    BisaQuestError, ChallengeAttempt, ChallengeItem, Environment, EnvironmentProgressRow,
    NewChallengeAttempt, NpcProgressRow, Result, MAX_ENCOUNTERS,
};

use super::{GameStore, SubmissionWrite};
use crate::progress::{granted_unlocks, merge_progress, progress_patch, EnvironmentRecalc};

pub struct PgGameStore {
    pub(crate) pool: PgPool,
}

/// sqlx's row-not-found becomes `NotFound`; everything else is a persistence failure.
fn db_error(e: sqlx::Error) -> BisaQuestError {
    match e {
        sqlx::Error::RowNotFound => BisaQuestError::not_found("row not found"),
        other => BisaQuestError::Persistence(other.to_string()),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NpcRow {
    player_id: Uuid,
    npc_id: String,
    encounters: i32,
    best_score: i32,
    is_completed: bool,
    completed_at: Option<DateTime<Utc>>,
}

impl From<NpcRow> for NpcProgressRow {
    fn from(r: NpcRow) -> Self {
        NpcProgressRow {
            player_id: r.player_id,
            npc_id: r.npc_id,
            encounters: r.encounters,
            best_score: r.best_score,
            is_completed: r.is_completed,
            completed_at: r.completed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EnvironmentRow {
    player_id: Uuid,
    environment_name: String,
    progress_percentage: i32,
    is_completed: bool,
    unlocked: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnvironmentRow> for EnvironmentProgressRow {
    type Error = BisaQuestError;

    fn try_from(r: EnvironmentRow) -> Result<Self> {
        let environment = r.environment_name.parse::<Environment>().map_err(|_| {
            BisaQuestError::Persistence(format!("unknown environment stored: {}", r.environment_name))
        })?;
        Ok(EnvironmentProgressRow {
            player_id: r.player_id,
            environment,
            progress_percentage: r.progress_percentage,
            is_completed: r.is_completed,
            unlocked: r.unlocked,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    player_id: Uuid,
    quest_id: String,
    npc_id: String,
    score: i32,
    max_score: i32,
    passed: bool,
    attempted_at: DateTime<Utc>,
}

impl From<AttemptRow> for ChallengeAttempt {
    fn from(r: AttemptRow) -> Self {
        ChallengeAttempt {
            id: r.id,
            player_id: r.player_id,
            quest_id: r.quest_id,
            npc_id: r.npc_id,
            score: r.score,
            max_score: r.max_score,
            passed: r.passed,
            attempted_at: r.attempted_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    item_id: Uuid,
    quest_id: String,
    label: String,
    correct_zone: String,
    is_correct: bool,
    round_number: i32,
    display_order: i32,
}

impl From<ItemRow> for ChallengeItem {
    fn from(r: ItemRow) -> Self {
        ChallengeItem {
            item_id: r.item_id,
            quest_id: r.quest_id,
            label: r.label,
            correct_zone: r.correct_zone,
            is_correct: r.is_correct,
            round_number: r.round_number,
            display_order: r.display_order,
        }
    }
}

const ENVIRONMENT_COLUMNS: &str =
    "player_id, environment_name, progress_percentage, is_completed, unlocked, updated_at";

impl PgGameStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BisaQuestError::Persistence(e.to_string()))?;
        Ok(())
    }
}

// --- Statements ---
//
// Each helper runs on a borrowed connection so the trait methods can compose
// them inside one transaction.

/// Create the player row if needed and lock it for the rest of the transaction.
/// Concurrent writers for the same player queue here.
async fn lock_player(conn: &mut PgConnection, player_id: Uuid) -> Result<Value> {
    sqlx::query("INSERT INTO players (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(player_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    sqlx::query_scalar::<_, Value>("SELECT progress_data FROM players WHERE id = $1 FOR UPDATE")
        .bind(player_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)
}

async fn write_blob(conn: &mut PgConnection, player_id: Uuid, blob: &Value) -> Result<()> {
    sqlx::query("UPDATE players SET progress_data = $2, updated_at = now() WHERE id = $1")
        .bind(player_id)
        .bind(blob)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

async fn insert_attempt(
    conn: &mut PgConnection,
    attempt: &NewChallengeAttempt,
) -> Result<ChallengeAttempt> {
    let row = sqlx::query_as::<_, AttemptRow>(
        r#"
        INSERT INTO player_quest_attempts
            (id, player_id, quest_id, npc_id, score, max_score, passed, attempted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, player_id, quest_id, npc_id, score, max_score, passed, attempted_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(attempt.player_id)
    .bind(&attempt.quest_id)
    .bind(&attempt.npc_id)
    .bind(attempt.score)
    .bind(attempt.max_score)
    .bind(attempt.passed)
    .bind(attempt.attempted_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(row.into())
}

async fn record_npc_result(
    conn: &mut PgConnection,
    attempt: &NewChallengeAttempt,
) -> Result<NpcProgressRow> {
    let row = sqlx::query_as::<_, NpcRow>(
        r#"
        INSERT INTO player_npc_progress
            (player_id, npc_id, encounters, best_score, is_completed, completed_at)
        VALUES ($1, $2, 1, $3, $4, $5)
        ON CONFLICT (player_id, npc_id) DO UPDATE SET
            encounters = LEAST(player_npc_progress.encounters + 1, $6),
            best_score = GREATEST(player_npc_progress.best_score, EXCLUDED.best_score),
            is_completed = player_npc_progress.is_completed OR EXCLUDED.is_completed,
            completed_at = COALESCE(player_npc_progress.completed_at, EXCLUDED.completed_at)
        RETURNING player_id, npc_id, encounters, best_score, is_completed, completed_at
        "#,
    )
    .bind(attempt.player_id)
    .bind(&attempt.npc_id)
    .bind(attempt.score)
    .bind(attempt.passed)
    .bind(attempt.passed.then_some(attempt.attempted_at))
    .bind(MAX_ENCOUNTERS)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(row.into())
}

/// Count and store in one statement. The percentage expression is
/// `completion_percentage`: round half up, 0 when the environment has no NPCs.
/// Percentage and completion are stored exactly; `unlocked` only ever turns on.
async fn store_environment_progress(
    conn: &mut PgConnection,
    player_id: Uuid,
    env: Environment,
    at: DateTime<Utc>,
) -> Result<EnvironmentProgressRow> {
    let sql = format!(
        r#"
        WITH counts AS (
            SELECT
                (SELECT COUNT(*) FROM npcs WHERE environment_name = $2) AS total,
                (SELECT COUNT(*)
                   FROM player_npc_progress p
                   JOIN npcs n ON n.npc_id = p.npc_id
                  WHERE p.player_id = $1
                    AND n.environment_name = $2
                    AND p.is_completed) AS completed
        ),
        pct AS (
            SELECT CASE
                       WHEN total = 0 THEN 0
                       ELSE ((LEAST(completed, total) * 200 + total) / (total * 2))::int
                   END AS percentage
            FROM counts
        )
        INSERT INTO player_environment_progress
            (player_id, environment_name, progress_percentage, is_completed, unlocked, updated_at)
        SELECT $1, $2, percentage, percentage = 100, $3, $4 FROM pct
        ON CONFLICT (player_id, environment_name) DO UPDATE SET
            progress_percentage = EXCLUDED.progress_percentage,
            is_completed = EXCLUDED.is_completed,
            unlocked = player_environment_progress.unlocked OR EXCLUDED.unlocked,
            updated_at = EXCLUDED.updated_at
        RETURNING {ENVIRONMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, EnvironmentRow>(&sql)
        .bind(player_id)
        .bind(env.as_str())
        .bind(env == Environment::Village)
        .bind(at)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;

    row.try_into()
}

async fn unlock_environment(
    conn: &mut PgConnection,
    player_id: Uuid,
    env: Environment,
    at: DateTime<Utc>,
) -> Result<EnvironmentProgressRow> {
    let sql = format!(
        r#"
        INSERT INTO player_environment_progress
            (player_id, environment_name, progress_percentage, is_completed, unlocked, updated_at)
        VALUES ($1, $2, 0, FALSE, TRUE, $3)
        ON CONFLICT (player_id, environment_name) DO UPDATE SET unlocked = TRUE
        RETURNING {ENVIRONMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, EnvironmentRow>(&sql)
        .bind(player_id)
        .bind(env.as_str())
        .bind(at)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;

    row.try_into()
}

async fn environment_rows(
    conn: &mut PgConnection,
    player_id: Uuid,
) -> Result<Vec<EnvironmentProgressRow>> {
    let sql =
        format!("SELECT {ENVIRONMENT_COLUMNS} FROM player_environment_progress WHERE player_id = $1");
    let rows = sqlx::query_as::<_, EnvironmentRow>(&sql)
        .bind(player_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;

    let mut out: Vec<EnvironmentProgressRow> = rows
        .into_iter()
        .map(EnvironmentProgressRow::try_from)
        .collect::<Result<_>>()?;
    out.sort_by_key(|r| r.environment);
    Ok(out)
}

/// Store `env`'s percentage and open the next environment when it is complete.
async fn recalc_environment(
    conn: &mut PgConnection,
    player_id: Uuid,
    env: Environment,
    at: DateTime<Utc>,
) -> Result<EnvironmentRecalc> {
    let row = store_environment_progress(conn, player_id, env, at).await?;
    let recalc = EnvironmentRecalc::from_row(&row);
    if let Some(next) = recalc.unlocked_next {
        unlock_environment(conn, player_id, next, at).await?;
    }
    Ok(recalc)
}

/// Merge into the locked blob and persist every unlock the result grants.
async fn merge_locked_blob(
    conn: &mut PgConnection,
    player_id: Uuid,
    existing: &Value,
    patch: &Value,
    at: DateTime<Utc>,
) -> Result<Value> {
    let merged = merge_progress(existing, patch);
    write_blob(conn, player_id, &merged).await?;

    let rows = environment_rows(conn, player_id).await?;
    for env in granted_unlocks(&merged, &rows) {
        unlock_environment(conn, player_id, env, at).await?;
    }
    Ok(merged)
}

#[async_trait]
impl GameStore for PgGameStore {
    async fn npc_environment(&self, npc_id: &str) -> Result<Option<Environment>> {
        let name = sqlx::query_scalar::<_, String>(
            "SELECT environment_name FROM npcs WHERE npc_id = $1",
        )
        .bind(npc_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match name {
            Some(name) => match name.parse::<Environment>() {
                Ok(env) => Ok(Some(env)),
                Err(_) => {
                    warn!(npc_id, environment = %name, "NPC assigned to unknown environment");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn record_submission(
        &self,
        attempt: &NewChallengeAttempt,
        env: Environment,
    ) -> Result<SubmissionWrite> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let at = attempt.attempted_at;

        // Taking the player lock first serializes submissions per player, so the
        // completion count below sees every earlier submission.
        let existing = lock_player(&mut *tx, attempt.player_id).await?;
        let stored = insert_attempt(&mut *tx, attempt).await?;
        let npc = record_npc_result(&mut *tx, attempt).await?;
        let environment = recalc_environment(&mut *tx, attempt.player_id, env, at).await?;

        let patch = progress_patch(env, environment.percentage, &npc.npc_id, &npc.completion());
        merge_locked_blob(&mut *tx, attempt.player_id, &existing, &patch, at).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(SubmissionWrite {
            attempt: stored,
            npc,
            environment,
        })
    }

    async fn recalc_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentRecalc> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let recalc = recalc_environment(&mut *tx, player_id, env, at).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(recalc)
    }

    async fn unlock_environment(
        &self,
        player_id: Uuid,
        env: Environment,
        at: DateTime<Utc>,
    ) -> Result<EnvironmentProgressRow> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        unlock_environment(&mut *conn, player_id, env, at).await
    }

    async fn environment_rows(&self, player_id: Uuid) -> Result<Vec<EnvironmentProgressRow>> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        environment_rows(&mut *conn, player_id).await
    }

    async fn attempts(
        &self,
        player_id: Uuid,
        quest_id: Option<&str>,
    ) -> Result<Vec<ChallengeAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT id, player_id, quest_id, npc_id, score, max_score, passed, attempted_at
            FROM player_quest_attempts
            WHERE player_id = $1
              AND ($2::text IS NULL OR quest_id = $2)
            ORDER BY attempted_at DESC
            "#,
        )
        .bind(player_id)
        .bind(quest_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn challenge_items(&self, quest_id: &str) -> Result<Vec<ChallengeItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT item_id, quest_id, label, correct_zone, is_correct, round_number, display_order
            FROM challenge_items
            WHERE quest_id = $1
            ORDER BY round_number ASC, display_order ASC
            "#,
        )
        .bind(quest_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn player_progress(&self, player_id: Uuid) -> Result<Option<Value>> {
        sqlx::query_scalar::<_, Value>("SELECT progress_data FROM players WHERE id = $1")
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn merge_player_progress(&self, player_id: Uuid, patch: &Value) -> Result<Value> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let existing = lock_player(&mut *tx, player_id).await?;
        let merged = merge_locked_blob(&mut *tx, player_id, &existing, patch, Utc::now()).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(merged)
    }

    async fn reset_player(&self, player_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let updated = sqlx::query(
            "UPDATE players SET progress_data = '{}'::jsonb, updated_at = now() WHERE id = $1",
        )
        .bind(player_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 0 {
            return Err(BisaQuestError::not_found(format!("player {player_id}")));
        }

        sqlx::query("DELETE FROM player_npc_progress WHERE player_id = $1")
            .bind(player_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        sqlx::query("DELETE FROM player_environment_progress WHERE player_id = $1")
            .bind(player_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }
}
