//! Core infrastructure: configuration, errors, shared state and
//! background task management.

pub mod config;
pub mod error;
pub mod state;
pub mod tasks;

pub use self::config::Config;
pub use self::error::{RepoError, Result};
pub use self::state::AppState;
pub use self::tasks::{BackgroundTasks, TaskKind};
