use crate::registry::{RegistryHandle, RouteError};
use adt_core::protocol::{
    AgentId, CommandId, CommandOutput, Envelope, ExecuteCommand, ExecuteRecurringCommand,
};
use adt_storage::{CommandStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("command {command_id} was stored but not delivered: {source}")]
    Undelivered {
        command_id: CommandId,
        source: RouteError,
    },
}

/// Persists submitted commands, routes them to agents and records what comes back.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn CommandStore>,
    registry: RegistryHandle,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn CommandStore>, registry: RegistryHandle) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn CommandStore> {
        &self.store
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub async fn submit_command(
        &self,
        agent_id: AgentId,
        command: &str,
    ) -> Result<CommandId, DispatchError> {
        let command_id = self.store.create_command(agent_id, command)?;
        let envelope = Envelope::ExecuteCommand(ExecuteCommand {
            id: command_id,
            command: command.to_string(),
        });
        self.deliver(agent_id, command_id, &envelope).await
    }

    pub async fn submit_recurring_command(
        &self,
        agent_id: AgentId,
        command: &str,
        interval_seconds: u64,
    ) -> Result<CommandId, DispatchError> {
        let command_id = self
            .store
            .create_recurring_command(agent_id, command, interval_seconds)?;
        let envelope = Envelope::ExecuteRecurringCommand(ExecuteRecurringCommand {
            id: command_id,
            command: command.to_string(),
            interval: interval_seconds,
        });
        self.deliver(agent_id, command_id, &envelope).await
    }

    async fn deliver(
        &self,
        agent_id: AgentId,
        command_id: CommandId,
        envelope: &Envelope,
    ) -> Result<CommandId, DispatchError> {
        match self.registry.route(agent_id, envelope).await {
            Ok(()) => {
                info!(
                    event = "command_dispatched",
                    agent_id,
                    command_id,
                    kind = %envelope.kind()
                );
                Ok(command_id)
            }
            Err(source) => {
                warn!(
                    event = "command_undelivered",
                    agent_id,
                    command_id,
                    error = %source
                );
                Err(DispatchError::Undelivered { command_id, source })
            }
        }
    }

    /// Handles one decoded envelope read from `agent_id`'s connection.
    pub fn handle_inbound(&self, agent_id: AgentId, envelope: Envelope) {
        match envelope {
            Envelope::ExecuteCommandResponse(response) => self.record_output(agent_id, response),
            Envelope::ExecuteRecurringCommandResponse(response) => {
                // Recurring outputs are observed only; nothing is stored per tick.
                info!(
                    event = "recurring_output",
                    agent_id,
                    command_id = response.id,
                    bytes = response.output.len(),
                    failed = response.error.is_some()
                );
                debug!(
                    event = "recurring_output_body",
                    agent_id,
                    command_id = response.id,
                    output = %response.output
                );
            }
            Envelope::Error(payload) => {
                warn!(
                    event = "agent_error",
                    agent_id,
                    code = payload.code,
                    message = %payload.message
                );
            }
            other => {
                warn!(event = "unexpected_envelope", agent_id, kind = %other.kind());
            }
        }
    }

    fn record_output(&self, agent_id: AgentId, response: CommandOutput) {
        if let Err(err) = self.store.set_command_output(response.id, &response.output) {
            warn!(
                event = "output_persist_failed",
                agent_id,
                command_id = response.id,
                error = %err
            );
            return;
        }
        if let Some(error) = response.error.as_deref() {
            if let Err(err) = self.store.set_command_error(response.id, error) {
                warn!(
                    event = "error_persist_failed",
                    agent_id,
                    command_id = response.id,
                    error = %err
                );
            }
        }
        debug!(event = "output_recorded", agent_id, command_id = response.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, Outbound};
    use adt_core::rest::{MachineInfo, OsUser};
    use adt_storage::SqliteStore;

    fn machine() -> MachineInfo {
        MachineInfo {
            hostname: "build-01".to_string(),
            os: "linux".to_string(),
            network_interfaces: Vec::new(),
            os_current_user: OsUser {
                username: "ops".to_string(),
                ..OsUser::default()
            },
        }
    }

    fn setup() -> (Dispatcher, Arc<SqliteStore>, AgentId) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open db"));
        let agent_id = store.register_agent(&machine()).expect("register");
        let dispatcher = Dispatcher::new(store.clone(), registry::spawn());
        (dispatcher, store, agent_id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submitted_command_reaches_the_connection_and_output_is_stored() {
        let (dispatcher, store, agent_id) = setup();
        let (conn, mut rx) = dispatcher.registry().open(agent_id, 8);
        dispatcher.registry().register(conn).await.expect("register");

        let command_id = dispatcher
            .submit_command(agent_id, "echo hi")
            .await
            .expect("dispatch");
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Text(format!(
                r#"{{"type":1,"data":{{"id":{command_id},"command":"echo hi"}}}}"#
            )))
        );

        dispatcher.handle_inbound(
            agent_id,
            Envelope::ExecuteCommandResponse(CommandOutput {
                id: command_id,
                output: "hi\n".to_string(),
                error: None,
            }),
        );
        let commands = store.list_commands(agent_id).expect("list");
        assert_eq!(commands[0].output.as_deref(), Some("hi\n"));
        assert_eq!(commands[0].error, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offline_agent_keeps_the_persisted_row() {
        let (dispatcher, store, agent_id) = setup();

        let err = dispatcher
            .submit_command(agent_id, "whoami")
            .await
            .unwrap_err();
        let command_id = match err {
            DispatchError::Undelivered { command_id, source } => {
                assert_eq!(source, RouteError::AgentNotFound(agent_id));
                command_id
            }
            other => panic!("unexpected error: {other}"),
        };

        let commands = store.list_commands(agent_id).expect("list");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id, command_id);
        assert_eq!(commands[0].output, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recurring_submission_carries_interval() {
        let (dispatcher, store, agent_id) = setup();
        let (conn, mut rx) = dispatcher.registry().open(agent_id, 8);
        dispatcher.registry().register(conn).await.expect("register");

        let command_id = dispatcher
            .submit_recurring_command(agent_id, "uptime", 15)
            .await
            .expect("dispatch");
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert_eq!(
            Envelope::decode(&text).expect("decode"),
            Envelope::ExecuteRecurringCommand(ExecuteRecurringCommand {
                id: command_id,
                command: "uptime".to_string(),
                interval: 15,
            })
        );
        assert_eq!(store.list_commands(agent_id).expect("list")[0].interval, Some(15));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_shot_error_is_stored_and_recurring_output_is_not() {
        let (dispatcher, store, agent_id) = setup();
        let one_shot = store.create_command(agent_id, "false").expect("create");
        let recurring = store
            .create_recurring_command(agent_id, "date", 5)
            .expect("create");

        dispatcher.handle_inbound(
            agent_id,
            Envelope::ExecuteCommandResponse(CommandOutput {
                id: one_shot,
                output: String::new(),
                error: Some("command exited with status 1".to_string()),
            }),
        );
        dispatcher.handle_inbound(
            agent_id,
            Envelope::ExecuteRecurringCommandResponse(CommandOutput {
                id: recurring,
                output: "Mon Jan 1\n".to_string(),
                error: None,
            }),
        );

        let commands = store.list_commands(agent_id).expect("list");
        assert_eq!(commands[0].output.as_deref(), Some(""));
        assert_eq!(
            commands[0].error.as_deref(),
            Some("command exited with status 1")
        );
        assert_eq!(commands[1].output, None);
    }

    #[tokio::test]
    async fn output_for_unknown_command_is_ignored() {
        let (dispatcher, store, agent_id) = setup();
        dispatcher.handle_inbound(
            agent_id,
            Envelope::ExecuteCommandResponse(CommandOutput {
                id: 999,
                output: "late".to_string(),
                error: None,
            }),
        );
        assert!(store.list_commands(agent_id).expect("list").is_empty());
    }
}
