use super::orchestrator::TallyOrchestrator;
use crate::error::TallyError;
use crate::executor::{Task, TaskHandlerRegistry, TaskKind};

use std::sync::Arc;

/// Wires `Tally` tasks and their failure hook to the orchestrator.
pub fn register(registry: &TaskHandlerRegistry, orchestrator: Arc<TallyOrchestrator>) {
    let handler = orchestrator.clone();
    registry.register(TaskKind::Tally, move |task| {
        let orchestrator = handler.clone();
        async move {
            match task {
                Task::Tally {
                    election_id,
                    chunk_id,
                } => {
                    orchestrator
                        .process_tally_chunk(&election_id, &chunk_id)
                        .await
                }
                other => Err(TallyError::Permanent(format!(
                    "tally handler received {} task",
                    other.kind()
                ))),
            }
        }
    });

    registry.on_failure(TaskKind::Tally, move |task, error| {
        let orchestrator = orchestrator.clone();
        async move {
            if let Task::Tally {
                election_id,
                chunk_id,
            } = task
            {
                orchestrator.on_tally_failed(&election_id, &chunk_id, &error);
            }
        }
    });
}
