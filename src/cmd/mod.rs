//! CLI command implementations.
//!
//! | Module   | Commands handled                                  |
//! |----------|---------------------------------------------------|
//! | `run`    | `Run`                                             |
//! | `items`  | `Add`, `Status`, `Unblock`, `Skip`, `Archive`     |
//! | `audit`  | `Audit`                                           |
//! | `config` | `Config`                                          |

pub mod audit;
pub mod config;
pub mod items;
pub mod run;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use items::{cmd_add, cmd_archive, cmd_skip, cmd_status, cmd_unblock};
pub use run::cmd_run;
