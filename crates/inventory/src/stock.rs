use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockguard_core::{AggregateRoot, Amount, DomainError, DomainResult, StockId};

/// A stock record: the shared quantity every adjustment strategy protects.
///
/// The record itself is a plain value. Stores own the durable copy and produce
/// successor values through [`StockRecord::committed`], which is the only place
/// the version stamp moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    id: StockId,
    quantity: u64,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// A freshly seeded record (version 0).
    pub fn seeded(id: StockId, quantity: u64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            quantity,
            version: 0,
            updated_at: at,
        }
    }

    /// Rebuild a record from persisted columns.
    pub fn from_parts(id: StockId, quantity: u64, version: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            quantity,
            version,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> StockId {
        self.id
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether `amount` can be taken from the current quantity.
    pub fn can_decrease(&self, amount: Amount) -> bool {
        self.quantity >= amount.get()
    }

    /// Quantity after taking `amount`, or `InsufficientQuantity`.
    pub fn decreased(&self, amount: Amount) -> DomainResult<u64> {
        self.quantity
            .checked_sub(amount.get())
            .ok_or_else(|| DomainError::insufficient(amount.get(), self.quantity))
    }

    /// Quantity after adding `amount`.
    pub fn increased(&self, amount: Amount) -> DomainResult<u64> {
        self.quantity.checked_add(amount.get()).ok_or_else(|| {
            DomainError::validation(format!(
                "quantity overflow ({} + {})",
                self.quantity,
                amount.get()
            ))
        })
    }

    /// Successor record after a committed write of `quantity`.
    pub fn committed(&self, quantity: u64, at: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            quantity,
            version: self.version + 1,
            updated_at: at,
        }
    }
}

impl AggregateRoot for StockRecord {
    type Id = StockId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
