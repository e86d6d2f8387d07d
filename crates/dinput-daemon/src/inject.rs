//! Replays remote input into virtual devices on a dedicated thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dinput_input::VirtualDeviceManager;
use dinput_types::{InputDevice, RawEvent};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// Work queued for the inject thread, applied in order.
#[derive(Debug)]
pub enum InjectCommand {
    Open {
        network_id: String,
        dh_id: String,
        device: InputDevice,
    },
    Close {
        network_id: String,
        dh_id: String,
    },
    /// Close every device of a peer.
    CloseAll { network_id: String },
    Events {
        network_id: String,
        events: Vec<RawEvent>,
    },
    /// Answered once everything queued before it is applied.
    Flush(oneshot::Sender<()>),
}

pub struct InjectWorker {
    manager: Arc<VirtualDeviceManager>,
    tx: Option<mpsc::UnboundedSender<InjectCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl InjectWorker {
    pub fn start(manager: Arc<VirtualDeviceManager>) -> Result<Self, DaemonError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker_manager = Arc::clone(&manager);
        let thread = thread::Builder::new()
            .name("dinput-inject".to_string())
            .spawn(move || {
                info!("inject worker started");
                while let Some(command) = rx.blocking_recv() {
                    apply(&worker_manager, command);
                }
                worker_manager.close_all_devices();
                info!("inject worker stopped");
            })
            .map_err(DaemonError::Spawn)?;
        Ok(Self {
            manager,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn manager(&self) -> &Arc<VirtualDeviceManager> {
        &self.manager
    }

    pub fn submit(&self, command: InjectCommand) -> Result<(), DaemonError> {
        self.tx
            .as_ref()
            .ok_or(DaemonError::NotRunning)?
            .send(command)
            .map_err(|_| DaemonError::NotRunning)
    }

    /// Wait until every command submitted so far has been applied.
    pub async fn flush(&self) -> Result<(), DaemonError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(InjectCommand::Flush(done_tx))?;
        done_rx.await.map_err(|_| DaemonError::NotRunning)
    }

    /// Drain the queue, close every virtual device and join the thread.
    pub fn stop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("inject worker thread panicked");
            }
        }
    }
}

impl Drop for InjectWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply(manager: &VirtualDeviceManager, command: InjectCommand) {
    match command {
        InjectCommand::Open {
            network_id,
            dh_id,
            device,
        } => {
            if let Err(e) = manager.open_devices_node(&network_id, &dh_id, &device) {
                warn!(network_id, dh_id, error = %e, "failed to create virtual device");
            }
        }
        InjectCommand::Close { network_id, dh_id } => {
            if let Err(e) = manager.close_device_node(&network_id, &dh_id) {
                debug!(network_id, dh_id, error = %e, "virtual device already gone");
            }
        }
        InjectCommand::CloseAll { network_id } => {
            let closed = manager.close_devices_of(&network_id);
            info!(network_id, closed, "closed virtual devices of peer");
        }
        InjectCommand::Events { network_id, events } => {
            let injected = manager.process_inject_events(&network_id, &events);
            debug!(network_id, injected, total = events.len(), "injected batch");
        }
        InjectCommand::Flush(done) => {
            let _ = done.send(());
        }
    }
}
