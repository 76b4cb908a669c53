use super::aggregator::ResultAggregator;
use crate::error::TallyError;
use crate::executor::{Task, TaskHandlerRegistry, TaskKind};

use std::sync::Arc;

/// Wires `Combine` tasks and their failure hook to the aggregator.
pub fn register(registry: &TaskHandlerRegistry, aggregator: Arc<ResultAggregator>) {
    let handler = aggregator.clone();
    registry.register(TaskKind::Combine, move |task| {
        let aggregator = handler.clone();
        async move {
            match task {
                Task::Combine {
                    election_id,
                    chunk_id,
                } => match aggregator.combine_chunk(&election_id, &chunk_id).await {
                    // Not a failure: the next guardian to complete schedules the chunk again.
                    Err(TallyError::InsufficientContributors {
                        chunk_id,
                        available,
                        threshold,
                    }) => {
                        tracing::warn!(
                            "Chunk {} has {} of {} required contributor(s); left for a later combine",
                            chunk_id,
                            available,
                            threshold
                        );
                        Ok(())
                    }
                    result => result,
                },
                other => Err(TallyError::Permanent(format!(
                    "combine handler received {} task",
                    other.kind()
                ))),
            }
        }
    });

    registry.on_failure(TaskKind::Combine, move |task, error| {
        let aggregator = aggregator.clone();
        async move {
            aggregator.on_combine_failed(task.chunk_id(), &error);
        }
    });
}
