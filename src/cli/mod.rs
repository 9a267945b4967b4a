//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Command Groups
//!
//! | Group | Purpose | Examples |
//! |-------|---------|----------|
//! | Core | Project management | `init`, `status` |
//! | Planning | Beads into tasks | `plan`, `estimate` |
//! | Execution | Running and reporting | `run`, `complete` |
//! | Work | Branch-scoped containers | `work create`, `work list`, `work remove` |
//! | Task | Task inspection and recovery | `task list`, `task requeue`, `task dep` |
//! | Query | Task state queries | `ready`, `blocked` |
//! | Workflow | Bead to pull request | `workflow start`, `workflow resume` |
//! | Outbox | GitHub effects | `outbox list`, `outbox sweep` |
//!
//! ## Output Formats
//!
//! All commands support `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! ## Verbose Mode
//!
//! Use `--verbose` (or `-v`) for debug logs on stderr:
//! ```bash
//! beadflow --verbose run w-7f2b4c1
//! ```
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod execute_cmd;
mod outbox_cmd;
mod output;
mod plan_cmd;
mod query;
mod services;
mod task;
mod work_cmd;
mod workflow_cmd;

pub use app::{run, Cli, Commands};
pub use output::{Output, OutputFormat};
