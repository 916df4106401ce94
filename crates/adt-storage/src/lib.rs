use adt_core::protocol::{AgentId, CommandId};
use adt_core::rest::{CommandRecord, MachineInfo};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Registered agent as stored, without live connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub machine_id: i64,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub username: String,
    pub display_name: String,
    pub os_user_id: String,
    pub os_group_id: String,
    pub home_directory: String,
}

/// Persistence operations the coordinator depends on.
///
/// Implementations must tolerate concurrent callers: every agent read loop
/// may record command output at the same time.
pub trait CommandStore: Send + Sync {
    fn register_agent(&self, machine: &MachineInfo) -> Result<AgentId, StorageError>;
    fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError>;
    fn agent_exists(&self, agent_id: AgentId) -> Result<bool, StorageError>;
    fn create_command(&self, agent_id: AgentId, command: &str) -> Result<CommandId, StorageError>;
    fn create_recurring_command(
        &self,
        agent_id: AgentId,
        command: &str,
        interval_seconds: u64,
    ) -> Result<CommandId, StorageError>;
    fn set_command_output(&self, command_id: CommandId, output: &str) -> Result<(), StorageError>;
    fn set_command_error(&self, command_id: CommandId, error: &str) -> Result<(), StorageError>;
    fn list_commands(&self, agent_id: AgentId) -> Result<Vec<CommandRecord>, StorageError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock();
            conn.execute_batch(include_str!("../migrations/0001_schema.sql"))?;
            conn.execute_batch("PRAGMA user_version = 1")?;
        }

        Ok(())
    }

    fn insert_command(
        &self,
        agent_id: AgentId,
        command: &str,
        interval_seconds: Option<i64>,
    ) -> Result<CommandId, StorageError> {
        let conn = self.lock();
        if !agent_row_exists(&conn, agent_id)? {
            return Err(StorageError::NotFound {
                entity: "agent",
                id: agent_id,
            });
        }
        conn.execute(
            "
            INSERT INTO commands (agent_id, command, interval_seconds, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![agent_id, command, interval_seconds, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_command(
        &self,
        command_id: CommandId,
        column_sql: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let changes = self.lock().execute(
            column_sql,
            params![value, Utc::now().to_rfc3339(), command_id],
        )?;
        if changes == 0 {
            return Err(StorageError::NotFound {
                entity: "command",
                id: command_id,
            });
        }
        Ok(())
    }
}

impl CommandStore for SqliteStore {
    fn register_agent(&self, machine: &MachineInfo) -> Result<AgentId, StorageError> {
        let interfaces_json = serde_json::to_string(&machine.network_interfaces)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let user = &machine.os_current_user;
        let groups_json = serde_json::to_string(&user.groups)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let name = format!("{}@{}", user.username, machine.hostname);

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "
            INSERT INTO machines (hostname, os, network_interfaces_json, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![machine.hostname, machine.os, interfaces_json, now],
        )?;
        let machine_id = tx.last_insert_rowid();
        tx.execute(
            "
            INSERT INTO agents (
                machine_id,
                name,
                username,
                display_name,
                os_user_id,
                os_group_id,
                home_directory,
                groups_json,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                machine_id,
                name,
                user.username,
                user.display_name,
                user.uid,
                user.gid,
                user.home_directory,
                groups_json,
                now,
            ],
        )?;
        let agent_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(agent_id)
    }

    fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "
            SELECT a.id, a.machine_id, a.name, m.hostname, m.os, a.username,
                   a.display_name, a.os_user_id, a.os_group_id, a.home_directory
            FROM agents a
            JOIN machines m ON m.id = a.machine_id
            ORDER BY a.id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentRecord {
                id: row.get(0)?,
                machine_id: row.get(1)?,
                name: row.get(2)?,
                hostname: row.get(3)?,
                os: row.get(4)?,
                username: row.get(5)?,
                display_name: row.get(6)?,
                os_user_id: row.get(7)?,
                os_group_id: row.get(8)?,
                home_directory: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn agent_exists(&self, agent_id: AgentId) -> Result<bool, StorageError> {
        agent_row_exists(&self.lock(), agent_id)
    }

    fn create_command(&self, agent_id: AgentId, command: &str) -> Result<CommandId, StorageError> {
        self.insert_command(agent_id, command, None)
    }

    fn create_recurring_command(
        &self,
        agent_id: AgentId,
        command: &str,
        interval_seconds: u64,
    ) -> Result<CommandId, StorageError> {
        let interval = i64::try_from(interval_seconds).map_err(|_| {
            StorageError::InvalidValue(format!("interval out of range: {interval_seconds}"))
        })?;
        self.insert_command(agent_id, command, Some(interval))
    }

    fn set_command_output(&self, command_id: CommandId, output: &str) -> Result<(), StorageError> {
        self.update_command(
            command_id,
            "UPDATE commands SET output = ?1, updated_at = ?2 WHERE id = ?3",
            output,
        )
    }

    fn set_command_error(&self, command_id: CommandId, error: &str) -> Result<(), StorageError> {
        self.update_command(
            command_id,
            "UPDATE commands SET error = ?1, updated_at = ?2 WHERE id = ?3",
            error,
        )
    }

    fn list_commands(&self, agent_id: AgentId) -> Result<Vec<CommandRecord>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "
            SELECT id, command, output, error, interval_seconds
            FROM commands
            WHERE agent_id = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            let interval: Option<i64> = row.get(4)?;
            Ok(CommandRecord {
                id: row.get(0)?,
                command: row.get(1)?,
                output: row.get(2)?,
                error: row.get(3)?,
                interval: interval.and_then(|value| u64::try_from(value).ok()),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn agent_row_exists(conn: &Connection, agent_id: AgentId) -> Result<bool, StorageError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM agents WHERE id = ?1",
            params![agent_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adt_core::rest::{NetworkInterface, OsUser, OsUserGroup};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn machine(hostname: &str) -> MachineInfo {
        MachineInfo {
            hostname: hostname.to_string(),
            os: "linux".to_string(),
            network_interfaces: vec![NetworkInterface {
                kind: "IPv4".to_string(),
                address: "10.0.0.4".to_string(),
                name: "eth0".to_string(),
            }],
            os_current_user: OsUser {
                username: "ops".to_string(),
                display_name: "Ops User".to_string(),
                uid: "1000".to_string(),
                gid: "1000".to_string(),
                home_directory: "/home/ops".to_string(),
                groups: vec![OsUserGroup {
                    id: "27".to_string(),
                    name: "sudo".to_string(),
                }],
            },
        }
    }

    #[test]
    fn migration_sets_schema_version() {
        let store = SqliteStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        store.migrate().expect("second migrate is a no-op");
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute_batch("PRAGMA user_version = 9").expect("bump");
        }
        let err = SqliteStore::open(file.path()).err().expect("must fail");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion {
                found: 9,
                supported: SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn registered_agents_are_listed_with_machine_fields() {
        let store = SqliteStore::open_in_memory().expect("open db");
        let first = store.register_agent(&machine("build-01")).expect("register");
        let second = store.register_agent(&machine("build-02")).expect("register");
        assert!(second > first);

        let agents = store.list_agents().expect("list");
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].id, first);
        assert_eq!(agents[0].name, "ops@build-01");
        assert_eq!(agents[1].hostname, "build-02");
        assert_eq!(agents[1].home_directory, "/home/ops");
        assert!(store.agent_exists(first).expect("exists"));
        assert!(!store.agent_exists(first + 100).expect("exists"));
    }

    #[test]
    fn commands_keep_output_error_and_interval() {
        let store = SqliteStore::open_in_memory().expect("open db");
        let agent = store.register_agent(&machine("build-01")).expect("register");

        let one_shot = store.create_command(agent, "echo hi").expect("create");
        let recurring = store
            .create_recurring_command(agent, "uptime", 30)
            .expect("create recurring");
        store.set_command_output(one_shot, "hi\n").expect("output");
        store
            .set_command_error(one_shot, "command exited with status 1")
            .expect("error");

        let commands = store.list_commands(agent).expect("list");
        assert_eq!(
            commands,
            vec![
                CommandRecord {
                    id: one_shot,
                    command: "echo hi".to_string(),
                    output: Some("hi\n".to_string()),
                    error: Some("command exited with status 1".to_string()),
                    interval: None,
                },
                CommandRecord {
                    id: recurring,
                    command: "uptime".to_string(),
                    output: None,
                    error: None,
                    interval: Some(30),
                },
            ]
        );
    }

    #[test]
    fn unknown_ids_report_not_found() {
        let store = SqliteStore::open_in_memory().expect("open db");
        assert!(matches!(
            store.create_command(5, "ls"),
            Err(StorageError::NotFound { entity: "agent", id: 5 })
        ));
        assert!(matches!(
            store.set_command_output(77, "x"),
            Err(StorageError::NotFound {
                entity: "command",
                id: 77
            })
        ));
    }

    #[test]
    fn concurrent_output_updates_are_all_applied() {
        let file = NamedTempFile::new().expect("temp db");
        let store = Arc::new(SqliteStore::open(file.path()).expect("open db"));
        let agent = store.register_agent(&machine("build-01")).expect("register");
        let ids: Vec<CommandId> = (0..8)
            .map(|n| store.create_command(agent, &format!("echo {n}")).expect("create"))
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || store.set_command_output(id, &format!("out-{id}")))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("set output");
        }

        let commands = store.list_commands(agent).expect("list");
        for record in commands {
            assert_eq!(record.output, Some(format!("out-{}", record.id)));
        }
    }
}
