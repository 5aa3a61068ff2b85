pub mod auth;
pub mod chain;
pub mod config;
pub mod engine;
pub mod http;
pub mod logger;
pub mod store;

pub use store::{ManagerInfo, ManagerStatus, ManagerStore, PendingSession, StoreError, Task, TaskHandle};
