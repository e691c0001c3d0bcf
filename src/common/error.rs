use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("not a script bundle: {}", .0.display())]
    NotABundle(PathBuf),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {}: {source}", entry.display())]
    Load {
        entry: PathBuf,
        #[source]
        source: mlua::Error,
    },

    #[error("instance pool closed: {}", .0.display())]
    PoolClosed(PathBuf),

    #[error("no idle instance after {0:?}")]
    PoolExhausted(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ScriptError {
    /// Whether this error comes from the bundle itself (bad path or broken script)
    /// and will not go away without changing files on disk.
    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    pub fn kind(&self) -> ScriptErrorKind {
        match self {
            ScriptError::NotABundle(_) => ScriptErrorKind::NotABundle,
            ScriptError::Io { .. } => ScriptErrorKind::Io,
            ScriptError::Load { .. } => ScriptErrorKind::Load,
            ScriptError::PoolClosed(_) => ScriptErrorKind::PoolClosed,
            ScriptError::PoolExhausted(_) => ScriptErrorKind::PoolExhausted,
            ScriptError::Config(_) => ScriptErrorKind::Config,
            ScriptError::Other(_) => ScriptErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    NotABundle,
    Io,
    Load,
    PoolClosed,
    PoolExhausted,
    Config,
    Other,
}

impl ScriptErrorKind {
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ScriptErrorKind::NotABundle | ScriptErrorKind::Load | ScriptErrorKind::Config
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptErrorKind::NotABundle => "NOT_A_BUNDLE",
            ScriptErrorKind::Io => "IO",
            ScriptErrorKind::Load => "LOAD",
            ScriptErrorKind::PoolClosed => "POOL_CLOSED",
            ScriptErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ScriptErrorKind::Config => "CONFIG",
            ScriptErrorKind::Other => "OTHER",
        }
    }
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;
