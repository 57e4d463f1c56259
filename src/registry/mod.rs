pub mod store;
pub mod task;

pub use store::{RegistryError, TaskRegistry};
pub use task::{error_status, LogEntry, LogRole, SystemLogEntry, Task, INITIAL_STATUS};
