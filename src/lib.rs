pub mod audio;
pub mod config;
pub mod ui;

pub use audio::{EngineConfig, LooperEngine, StreamingManager};
pub use config::{FootswitchScript, LooperSettings};
pub use ui::TerminalUI;
