//! The only component that issues persistence operations. Exposes one
//! typed repository per entity, each borrowing the shared `SqlitePool` —
//! the centralized-seam version of the teacher's free functions over
//! `&SqlitePool` in its storage module, needed here so other components
//! can depend on `Store` through a trait object in tests.

mod analysis_run_items;
mod analysis_runs;
mod feed_health;
mod feeds;
mod fetch_logs;
mod feature_flags;
mod item_analysis;
mod items;
mod pending_auto_analysis;

pub use analysis_run_items::AnalysisRunItemsRepo;
pub use analysis_runs::AnalysisRunsRepo;
pub use feed_health::FeedHealthRepo;
pub use feeds::FeedsRepo;
pub use fetch_logs::FetchLogsRepo;
pub use feature_flags::FeatureFlagsRepo;
pub use item_analysis::ItemAnalysisRepo;
pub use items::ItemsRepo;
pub use pending_auto_analysis::PendingAutoAnalysisRepo;

use sqlx::SqlitePool;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feeds(&self) -> FeedsRepo<'_> {
        FeedsRepo::new(&self.pool)
    }

    pub fn items(&self) -> ItemsRepo<'_> {
        ItemsRepo::new(&self.pool)
    }

    pub fn fetch_logs(&self) -> FetchLogsRepo<'_> {
        FetchLogsRepo::new(&self.pool)
    }

    pub fn feed_health(&self) -> FeedHealthRepo<'_> {
        FeedHealthRepo::new(&self.pool)
    }

    pub fn analysis_runs(&self) -> AnalysisRunsRepo<'_> {
        AnalysisRunsRepo::new(&self.pool)
    }

    pub fn analysis_run_items(&self) -> AnalysisRunItemsRepo<'_> {
        AnalysisRunItemsRepo::new(&self.pool)
    }

    pub fn item_analysis(&self) -> ItemAnalysisRepo<'_> {
        ItemAnalysisRepo::new(&self.pool)
    }

    pub fn pending_auto_analysis(&self) -> PendingAutoAnalysisRepo<'_> {
        PendingAutoAnalysisRepo::new(&self.pool)
    }

    pub fn feature_flags(&self) -> FeatureFlagsRepo<'_> {
        FeatureFlagsRepo::new(&self.pool)
    }
}
