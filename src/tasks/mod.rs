/// Concrete background tasks
///
/// The roster is fixed at build time: the scheduler registers exactly what
/// [`default_roster`] returns.

pub mod prices;
pub mod trades;

pub use prices::{CommandPriceSync, DailyPriceUpdateTask, PriceSync};
pub use trades::DailyTradesTask;

use crate::runtime::Task;
use std::sync::Arc;

pub fn default_roster(
    trades: DailyTradesTask,
    prices: DailyPriceUpdateTask,
) -> Vec<Arc<dyn Task>> {
    vec![Arc::new(trades), Arc::new(prices)]
}
