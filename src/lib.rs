pub mod cascade_config;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod retrieval;
pub mod stage;
pub mod ui;
pub mod util;
pub mod validator;
