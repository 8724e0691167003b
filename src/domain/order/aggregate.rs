use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;

use super::errors::OrderError;
use super::line_item::LineItem;
use super::patch::OrderPatch;
use super::value_objects::{Money, OrderId, OrderStatus, TrackingNumber};

// ============================================================================
// Order Entity - Domain Logic
// ============================================================================
//
// The entity guards its own timestamps (each stamped at most once) and the
// running total (never negative). Pipeline preconditions that depend on the
// status column live in the service, which owns the transition table.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: OrderId,
    pub revision: i64,

    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub total: Money,
    pub tracking_number: Option<TrackingNumber>,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Order {
    /// New pending order with a zero total and no tracking number.
    pub fn create(customer_id: CustomerId) -> Self {
        Self {
            id: OrderId::new(),
            revision: 0,
            customer_id,
            status: OrderStatus::Pending,
            total: Money::ZERO,
            tracking_number: None,
            created_at: Utc::now(),
            started_at: None,
            ready_at: None,
            deleted_at: None,
        }
    }

    /// True until the order is soft-cancelled.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Active and not yet handed over.
    pub fn is_open(&self) -> bool {
        self.is_active() && self.status.is_open()
    }

    /// Line items may only change on orders that are still open.
    pub fn ensure_modifiable(&self) -> Result<(), OrderError> {
        if !self.is_active() || self.status == OrderStatus::Cancelled {
            return Err(OrderError::AlreadyCancelled);
        }
        if self.status == OrderStatus::Done {
            return Err(OrderError::AlreadyDone);
        }
        Ok(())
    }

    pub fn pay(&mut self) -> Result<(), OrderError> {
        if self.status != OrderStatus::Pending {
            return Err(OrderError::AlreadyProcessing);
        }
        self.status = OrderStatus::Processing;
        Ok(())
    }

    /// Settlement callback: processing -> confirmed.
    pub fn confirm_payment(&mut self) -> Result<(), OrderError> {
        if self.status != OrderStatus::Processing {
            return Err(OrderError::PaymentNotPending);
        }
        self.status = OrderStatus::Confirmed;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), OrderError> {
        if self.started_at.is_some() {
            return Err(OrderError::AlreadyStarted);
        }
        self.started_at = Some(Utc::now());
        self.status = OrderStatus::Started;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), OrderError> {
        if self.ready_at.is_some() {
            return Err(OrderError::AlreadyDone);
        }
        self.ready_at = Some(Utc::now());
        self.status = OrderStatus::Done;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), OrderError> {
        if self.deleted_at.is_some() {
            return Err(OrderError::AlreadyCancelled);
        }
        self.deleted_at = Some(Utc::now());
        self.status = OrderStatus::Cancelled;
        Ok(())
    }

    pub fn add_to_total(&mut self, amount: Money) -> Result<(), OrderError> {
        self.total = self
            .total
            .checked_add(amount)
            .ok_or_else(|| OrderError::Internal(format!("order {} total overflow", self.id)))?;
        Ok(())
    }

    pub fn subtract_from_total(&mut self, amount: Money) -> Result<(), OrderError> {
        self.total = self.total.checked_sub(amount).ok_or_else(|| {
            OrderError::Internal(format!(
                "order {} total {} is below line item total {}",
                self.id, self.total, amount
            ))
        })?;
        Ok(())
    }

    /// Tracking numbers are assigned once and never replaced.
    pub fn assign_tracking_number(&mut self, number: TrackingNumber) {
        if self.tracking_number.is_none() {
            self.tracking_number = Some(number);
        }
    }

    /// Apply the non-empty fields of a patch and bump the revision.
    pub fn apply_patch(&mut self, patch: &OrderPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(total) = patch.total {
            self.total = total;
        }
        if let Some(number) = patch.tracking_number {
            self.tracking_number = Some(number);
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(ready_at) = patch.ready_at {
            self.ready_at = Some(ready_at);
        }
        if let Some(deleted_at) = patch.deleted_at {
            self.deleted_at = Some(deleted_at);
        }
        self.revision += 1;
    }
}

/// An order together with its live line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: Order,
    pub line_items: Vec<LineItem>,
}

impl OrderDetails {
    pub fn line_items_total(&self) -> Option<Money> {
        self.line_items
            .iter()
            .try_fold(Money::ZERO, |acc, item| acc.checked_add(item.total))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
