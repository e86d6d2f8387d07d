//! Daemon errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("input error: {0}")]
    Input(#[from] dinput_input::InputError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("key combination has {0} keys, at most {max} are allowed", max = crate::whitelist::MAX_COMBINATION_KEYS)]
    CombinationTooLong(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
