pub mod commands;
pub mod config;
pub mod render;

pub use commands::{Command, Shell};
pub use config::{data_dir, load_runtime_settings, save_runtime_settings, Scope};
