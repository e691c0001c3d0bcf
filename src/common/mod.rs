pub mod error;

pub use error::{Result, ScriptError, ScriptErrorKind};
