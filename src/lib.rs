pub mod common;
pub mod config;
pub mod plugin;

pub use common::{ScriptError, ScriptErrorKind};
pub use plugin::{Bundle, InstancePool, ScriptLoader, ScriptManager};
