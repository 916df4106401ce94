pub mod backoff;
pub mod config;
pub mod connection;
pub mod executor;
pub mod link;
pub mod machine;
pub mod registration;
pub mod scheduler;
pub mod state;

pub use connection::{ConnectionManager, ConnectionState, ManagerConfig};
pub use executor::{Execute, ShellExecutor};
