//! Command-line interface and orchestration for ghsync
//!
//! # Commands
//!
//! - **collect**: run the default (or `--task`-selected) sub-tasks for one repository,
//!   collecting raw records and extracting them into tool rows
//! - **extract**: re-run only the extraction sub-tasks over stored raw records
//! - **tasks**: list the sub-tasks in the order they run
//! - **init**: write the default configuration file
//!
//! Settings come from a TOML configuration file (`ghsync.toml` by default), with
//! command-line flags taking precedence. The `common` module resolves them into a
//! store, an API client, and the collection scope, then runs the selected sub-tasks.

mod collect;
mod common;
mod config;
mod extract;
mod host;
mod init;
mod progress_reporter;
mod run;
mod tasks;

#[cfg(debug_assertions)]
pub use config::Config;

pub use collect::{CollectArgs, process_collect};
pub use extract::{ExtractArgs, process_extract};
pub use host::Host;
pub use init::{InitArgs, init_config};
pub use progress_reporter::ProgressReporter;
pub use run::run;
pub use tasks::{TasksArgs, list_tasks};
