use std::sync::Arc;

use crate::store::TrackingSequence;

use super::errors::OrderError;
use super::value_objects::TrackingNumber;

// ============================================================================
// Tracking Number Allocator
// ============================================================================
//
// Numbers come from a shared cyclic sequence in [1, 999]. An order keeps the
// number it was given; asking again returns the same one without touching the
// sequence.
//
// ============================================================================

#[derive(Clone)]
pub struct TrackingNumberAllocator {
    sequence: Arc<dyn TrackingSequence>,
}

impl TrackingNumberAllocator {
    pub fn new(sequence: Arc<dyn TrackingSequence>) -> Self {
        Self { sequence }
    }

    /// Keep `current` if set, otherwise draw the next number.
    pub async fn get_or_assign(
        &self,
        current: Option<TrackingNumber>,
    ) -> Result<TrackingNumber, OrderError> {
        if let Some(number) = current {
            return Ok(number);
        }

        let number = self.sequence.next_value().await?;
        tracing::debug!(tracking_number = %number, "Allocated tracking number");
        Ok(number)
    }

    /// Restart the cycle at 1. Numbers already on orders are untouched.
    pub async fn reset(&self) -> Result<(), OrderError> {
        self.sequence.reset().await?;
        tracing::info!("Tracking numbers reset");
        Ok(())
    }
}
