//! I/O adapters for agentrun commands: processes, tools, and on-disk state.

pub mod clock;
pub mod config;
pub mod events;
pub mod gh;
pub mod git;
pub mod interact;
pub mod lock;
pub mod paths;
pub mod process;
pub mod repo;
pub mod run_store;
pub mod scripts;
pub mod tmux;
