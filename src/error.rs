//! Error types for the evolution engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("another engine holds the lock: {}", .0.display())]
    LockHeld(PathBuf),

    #[error("corrupt state file {}: {message}", .path.display())]
    StateCorrupt { path: PathBuf, message: String },

    #[error("lm unavailable: {0}")]
    LmUnavailable(String),

    #[error("lm error: {0}")]
    Lm(String),

    #[error("verify failed: {0}")]
    VerifyFail(String),

    #[error("boundary violation: touched {0}")]
    BoundaryViolation(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("project not initialized: {} (run: evonest init)", .0.display())]
    NotInitialized(PathBuf),

    #[error("no mutations available: {0}")]
    NoMutations(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::StateCorrupt {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Process exit code for the CLI wrapper.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockHeld(_) => 2,
            Self::Config(_) => 3,
            Self::VerifyFail(_) => 4,
            Self::LmUnavailable(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(Error::LockHeld("/p/.lock".into()).exit_code(), 2);
        assert_eq!(Error::config("bad level").exit_code(), 3);
        assert_eq!(Error::VerifyFail("tests".into()).exit_code(), 4);
        assert_eq!(Error::LmUnavailable("not found".into()).exit_code(), 5);
        assert_eq!(Error::git("stash").exit_code(), 1);
    }
}
