//! Hot-plug monitoring on a dedicated thread.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use dinput_input::{HubMode, InputHub};
use dinput_types::InputDeviceEvent;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// Most device changes handed over per wake-up.
const CHANGE_BATCH: usize = 16;

/// Owns a monitor-mode hub and forwards device changes over a channel.
pub struct DeviceMonitor {
    hub: Arc<InputHub>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    pub fn new(hub: InputHub) -> Result<Self, DaemonError> {
        if hub.mode() != HubMode::PluginMonitor {
            return Err(DaemonError::Config(
                "device monitor needs a plug-in monitor hub".to_string(),
            ));
        }
        Ok(Self {
            hub: Arc::new(hub),
            thread: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &Arc<InputHub> {
        &self.hub
    }

    pub fn start(&self, tx: mpsc::Sender<InputDeviceEvent>) -> Result<(), DaemonError> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        let hub = Arc::clone(&self.hub);
        let handle = thread::Builder::new()
            .name("dinput-monitor".to_string())
            .spawn(move || {
                info!("device monitor started");
                'outer: loop {
                    let mut changes = Vec::with_capacity(CHANGE_BATCH);
                    if hub.start_collect_input_handler(&mut changes, CHANGE_BATCH) == 0 {
                        break;
                    }
                    for change in changes {
                        if tx.blocking_send(change).is_err() {
                            debug!("device change receiver closed");
                            hub.stop_collect_input_handler();
                            break 'outer;
                        }
                    }
                }
                info!("device monitor stopped");
            })
            .map_err(DaemonError::Spawn)?;
        *thread = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.hub.stop_collect_input_handler();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("device monitor thread panicked");
            }
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
