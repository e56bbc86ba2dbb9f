pub mod bar_store;
pub mod historical_sync;
pub mod scheduler;
pub mod series;
pub mod sqlite_store;
pub mod validation;

pub use bar_store::{BarStore, MemoryBarStore};
pub use historical_sync::{save_sync_report, SyncEngine, SyncReport, SyncWindow, TupleReport, TupleStatus};
pub use scheduler::{jobs_for, ScheduleSummary, SyncJob};
pub use series::{missing_periods, Series, SeriesDefect};
pub use sqlite_store::SqliteBarStore;
pub use validation::{check_bar, validate_bars, BarRejection, ValidatedBatch};
