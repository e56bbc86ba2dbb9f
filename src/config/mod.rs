pub mod loader;
pub mod universe;

pub use loader::{load_config, parse_config, validate_config};
pub use universe::{build_sync_tasks, load_symbol_file, symbols_for};
