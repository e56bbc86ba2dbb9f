pub mod indicators;
pub mod liquidity;
pub mod ma_crossover;
pub mod regime;
pub mod signal_monitor;

pub use indicators::*;
pub use liquidity::{AnnotatedEvent, IlliquidReason, Liquidity, LiquidityFilter};
pub use ma_crossover::{CrossDirection, CrossoverEvent, CrossoverIter, MaCrossover, MaSignal};
pub use regime::{RegimeSummary, TrendStatus};
pub use signal_monitor::{SignalMonitor, SignalReport};
