use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate::Order;
use super::value_objects::{Money, OrderStatus, TrackingNumber};

/// Partial order update. Stores write only the fields that are `Some`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub total: Option<Money>,
    pub tracking_number: Option<TrackingNumber>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl OrderPatch {
    /// Fields of `after` that differ from `before`.
    ///
    /// Optional columns are never cleared by a patch, so a field that went
    /// from `Some` back to `None` is not represented.
    pub fn diff(before: &Order, after: &Order) -> Self {
        fn changed<T: PartialEq + Copy>(before: T, after: T) -> Option<T> {
            (before != after).then_some(after)
        }

        fn set<T: PartialEq + Copy>(before: Option<T>, after: Option<T>) -> Option<T> {
            if before != after {
                after
            } else {
                None
            }
        }

        Self {
            status: changed(before.status, after.status),
            total: changed(before.total, after.total),
            tracking_number: set(before.tracking_number, after.tracking_number),
            started_at: set(before.started_at, after.started_at),
            ready_at: set(before.ready_at, after.ready_at),
            deleted_at: set(before.deleted_at, after.deleted_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &OrderPatch::default()
    }
}
