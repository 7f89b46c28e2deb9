pub mod constants;
pub mod engine;
pub mod handlers;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod orchestrator;
pub mod repl;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod todos;
pub mod types;

pub use types::*;

pub use main_helper::{build_router, AppState, ChatArgs, Cli, Command, ServeArgs};
