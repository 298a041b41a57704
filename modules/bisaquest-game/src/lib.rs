pub mod progress;
pub mod selection;
pub mod store;
pub mod submission;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use progress::{
    completion_percentage, environment_view, is_unlocked, lobby_view, merge_progress,
    recalc_environment_progress, EnvironmentRecalc, EnvironmentView, LobbyEntry, LobbyView,
    ProgressSnapshot,
};
pub use selection::{ordered_pool, select_round_items, DEFAULT_ROUND_SIZE};
pub use store::{GameStore, PgGameStore, SubmissionWrite};
pub use submission::{submit_quest_attempt, SubmissionOutcome, SubmitAttempt};
