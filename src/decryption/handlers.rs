use super::orchestrator::DecryptionOrchestrator;
use crate::error::TallyError;
use crate::executor::{Task, TaskHandlerRegistry, TaskKind};

use std::sync::Arc;

/// Wires `PartialDecrypt` and `CompensatedDecrypt` tasks, and their shared failure hook.
pub fn register(registry: &TaskHandlerRegistry, orchestrator: Arc<DecryptionOrchestrator>) {
    let handler = orchestrator.clone();
    registry.register(TaskKind::PartialDecrypt, move |task| {
        let orchestrator = handler.clone();
        async move {
            match task {
                Task::PartialDecrypt {
                    election_id,
                    chunk_id,
                    guardian_id,
                    run_id,
                } => {
                    orchestrator
                        .process_partial(&election_id, &chunk_id, &guardian_id, &run_id)
                        .await
                }
                other => Err(TallyError::Permanent(format!(
                    "partial decryption handler received {} task",
                    other.kind()
                ))),
            }
        }
    });

    let handler = orchestrator.clone();
    registry.register(TaskKind::CompensatedDecrypt, move |task| {
        let orchestrator = handler.clone();
        async move {
            match task {
                Task::CompensatedDecrypt {
                    election_id,
                    chunk_id,
                    guardian_id,
                    missing_guardian_id,
                    run_id,
                } => {
                    orchestrator
                        .process_compensated(
                            &election_id,
                            &chunk_id,
                            &guardian_id,
                            &missing_guardian_id,
                            &run_id,
                        )
                        .await
                }
                other => Err(TallyError::Permanent(format!(
                    "compensated decryption handler received {} task",
                    other.kind()
                ))),
            }
        }
    });

    for kind in [TaskKind::PartialDecrypt, TaskKind::CompensatedDecrypt] {
        let orchestrator = orchestrator.clone();
        registry.on_failure(kind, move |task, error| {
            let orchestrator = orchestrator.clone();
            async move {
                match task {
                    Task::PartialDecrypt {
                        election_id,
                        chunk_id,
                        guardian_id,
                        run_id,
                    }
                    | Task::CompensatedDecrypt {
                        election_id,
                        chunk_id,
                        guardian_id,
                        run_id,
                        ..
                    } => orchestrator.on_decryption_failed(
                        &election_id,
                        &guardian_id,
                        &run_id,
                        &chunk_id,
                        &error,
                    ),
                    _ => {}
                }
            }
        });
    }
}
