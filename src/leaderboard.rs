pub mod attributes;
pub mod engine;
pub mod window;

pub use attributes::{
    is_reversed, AttributeCatalog, LeaderboardAttribute, StaticCatalog, SubjectKind,
    SubjectUpdate, LEADERBOARDS_COUNT, TOP_1_LEADERBOARDS_COUNT,
};
pub use engine::{EngineConfig, LeaderboardEngine, RankedEntry, SweepReport, UpdateOutcome};
pub use window::{LeaderboardWindow, WINDOW_SIZE};
