//! Change dispatcher: delivers a batch to a handler in order.

use crate::error::{DispatchError, HandlerError};
use changefeed_protocol::{ChangeEnvelope, PartitionRangeId};
use std::future::{ready, Future};

/// Application callback invoked once per change.
///
/// Closures `FnMut(&ChangeEnvelope<T>) -> Result<(), HandlerError>` implement
/// this trait; implement it directly for handlers that need to await.
pub trait ChangeHandler<T>: Send {
    /// Handles one change. An error stops the batch.
    fn handle(
        &mut self,
        change: &ChangeEnvelope<T>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<T, F> ChangeHandler<T> for F
where
    F: FnMut(&ChangeEnvelope<T>) -> Result<(), HandlerError> + Send,
{
    fn handle(
        &mut self,
        change: &ChangeEnvelope<T>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        ready(self(change))
    }
}

/// Summary of a fully delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Number of changes handled.
    pub delivered: usize,
}

/// Invokes `handler` for each change in order.
///
/// Stops at the first failure; later changes are not invoked. The caller
/// decides whether to redeliver.
pub async fn dispatch<T, H>(
    partition_range_id: &PartitionRangeId,
    changes: &[ChangeEnvelope<T>],
    handler: &mut H,
) -> Result<DispatchReport, DispatchError>
where
    H: ChangeHandler<T>,
{
    for (index, change) in changes.iter().enumerate() {
        if let Err(source) = handler.handle(change).await {
            return Err(DispatchError {
                partition_range_id: partition_range_id.clone(),
                succeeded: index,
                failed_index: index,
                not_attempted: changes.len() - index - 1,
                source,
            });
        }
    }

    Ok(DispatchReport {
        delivered: changes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: &[u32]) -> Vec<ChangeEnvelope<u32>> {
        ids.iter()
            .map(|&document| ChangeEnvelope::Plain { document })
            .collect()
    }

    struct Recorder {
        seen: Vec<u32>,
        fail_on: Option<u32>,
    }

    impl ChangeHandler<u32> for Recorder {
        async fn handle(&mut self, change: &ChangeEnvelope<u32>) -> Result<(), HandlerError> {
            tokio::task::yield_now().await;
            self.seen.push(*change.document());
            match self.fail_on {
                Some(id) if id == *change.document() => Err(HandlerError::new("rejected")),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let mut seen = Vec::new();
        let mut handler = |change: &ChangeEnvelope<u32>| -> Result<(), HandlerError> {
            seen.push(*change.document());
            Ok(())
        };

        let report = dispatch(&"r".into(), &batch(&[3, 1, 2]), &mut handler)
            .await
            .unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(seen, [3, 1, 2]);
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: Some(20),
        };

        let err = dispatch(&"r".into(), &batch(&[10, 20, 30]), &mut handler)
            .await
            .unwrap_err();

        assert_eq!(err.succeeded_indices(), 0..1);
        assert_eq!(err.failed_index, 1);
        assert_eq!(err.not_attempted, 1);
        assert_eq!(err.source.message(), "rejected");
        // Entry 30 was never invoked.
        assert_eq!(handler.seen, [10, 20]);
    }

    #[tokio::test]
    async fn empty_batch_is_trivially_delivered() {
        let mut handler = Recorder {
            seen: Vec::new(),
            fail_on: None,
        };
        let report = dispatch(&"r".into(), &batch(&[]), &mut handler)
            .await
            .unwrap();
        assert_eq!(report, DispatchReport { delivered: 0 });
    }
}
