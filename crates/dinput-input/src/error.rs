//! Input subsystem errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to open device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device {path} is a dinput virtual device")]
    VirtualDevice { path: PathBuf },

    #[error("failed to query device {path}: {reason}")]
    DeviceQuery { path: PathBuf, reason: String },

    #[error("device {path} has no supported class")]
    UnsupportedClass { path: PathBuf },

    #[error("readiness notification failed: {0}")]
    Readiness(#[source] io::Error),

    #[error("device directory watch failed: {0}")]
    Watch(#[source] io::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to create virtual device: {0}")]
    VirtualDeviceCreate(String),

    #[error("failed to inject event: {0}")]
    Inject(String),

    #[error("invalid screen info: {0}")]
    ScreenInfo(#[from] dinput_types::ScreenError),

    #[error("no remote state sink registered")]
    NoRemoteSink,

    #[error("backend not available on this platform")]
    Unavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InputError {
    /// Status code for callers that only carry integers across a boundary.
    pub fn code(&self) -> i32 {
        match self {
            Self::DeviceOpen { .. } => -67001,
            Self::VirtualDevice { .. } => -67002,
            Self::DeviceQuery { .. } => -67003,
            Self::UnsupportedClass { .. } => -67004,
            Self::Readiness(_) => -67005,
            Self::Watch(_) => -67006,
            Self::DeviceNotFound(_) => -67007,
            Self::VirtualDeviceCreate(_) => -67008,
            Self::Inject(_) => -67009,
            Self::ScreenInfo(_) => -67010,
            Self::NoRemoteSink => -67011,
            Self::Unavailable => -67012,
            Self::Other(_) => -67099,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            InputError::DeviceOpen {
                path: PathBuf::from("/dev/input/event0"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
            InputError::VirtualDevice {
                path: PathBuf::new(),
            },
            InputError::DeviceQuery {
                path: PathBuf::new(),
                reason: String::new(),
            },
            InputError::UnsupportedClass {
                path: PathBuf::new(),
            },
            InputError::Readiness(io::Error::from(io::ErrorKind::Other)),
            InputError::Watch(io::Error::from(io::ErrorKind::Other)),
            InputError::DeviceNotFound(String::new()),
            InputError::VirtualDeviceCreate(String::new()),
            InputError::Inject(String::new()),
            InputError::ScreenInfo(dinput_types::ScreenError::ZeroShowSize),
            InputError::NoRemoteSink,
            InputError::Unavailable,
            InputError::Other(anyhow::anyhow!("boom")),
        ];
        let mut codes: Vec<i32> = errors.iter().map(InputError::code).collect();
        assert!(codes.iter().all(|c| (-67099..=-67001).contains(c)));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
