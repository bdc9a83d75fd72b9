use stockguard_core::StockId;
use stockguard_inventory::StockRecord;

use crate::error::AdjustResult;

/// Adjusts the quantity of one stock record under some concurrency control.
///
/// Amounts are raw `u64`s; zero is rejected with
/// [`AdjustError::Domain`](crate::AdjustError::Domain) before any lock is taken.
/// On success the committed record (new quantity and version) is returned.
pub trait StockAdjuster: Send + Sync {
    /// Remove `amount` units. What happens on short stock depends on the strategy.
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord>;

    /// Add `amount` units.
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord>;
}
