//! Routing daemon for dinput.
//!
//! Drives the input engine from worker threads (event collection, hot-plug
//! monitoring, virtual device injection) and connects it to peers through a
//! [`Transport`]: local devices are announced and forwarded on request, and
//! remote devices are recreated and replayed locally.

pub mod collector;
pub mod config;
pub mod daemon;
pub mod error;
pub mod inject;
pub mod monitor;
pub mod setup;
pub mod transport;
pub mod whitelist;

pub use collector::{InputCollector, SharingListener};
pub use config::Config;
pub use daemon::{Daemon, DaemonEvent, DaemonStatus};
pub use error::DaemonError;
pub use inject::{InjectCommand, InjectWorker};
pub use monitor::DeviceMonitor;
pub use transport::{ChannelTransport, PeerMessage, Transport};
pub use whitelist::WhiteList;
