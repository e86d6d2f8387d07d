//! Raw event collection on a dedicated thread.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use dinput_input::{HubMode, InputHub};
use dinput_types::{AffectDhIds, InputTypes, RawEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DaemonError;

/// Notified whenever the set of shared devices changes.
pub trait SharingListener: Send + Sync {
    fn on_sharing_changed(&self, affected: &AffectDhIds);
}

/// Owns an event-collection hub and drives it from its own thread.
pub struct InputCollector {
    hub: Arc<InputHub>,
    listeners: Mutex<Vec<Arc<dyn SharingListener>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InputCollector {
    pub fn new(hub: InputHub) -> Result<Self, DaemonError> {
        if hub.mode() != HubMode::EventCollection {
            return Err(DaemonError::Config(
                "collector needs an event-collection hub".to_string(),
            ));
        }
        Ok(Self {
            hub: Arc::new(hub),
            listeners: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &Arc<InputHub> {
        &self.hub
    }

    /// Spawn the collection thread. Each batch of forwarded events is sent
    /// on `tx`; the thread ends when the hub is stopped or `tx` is closed.
    pub fn start(
        &self,
        tx: mpsc::Sender<Vec<RawEvent>>,
        buffer_size: usize,
    ) -> Result<(), DaemonError> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        let hub = Arc::clone(&self.hub);
        let capacity = buffer_size.max(1);
        let handle = thread::Builder::new()
            .name("dinput-collector".to_string())
            .spawn(move || {
                info!("input collector started");
                loop {
                    let mut batch = Vec::with_capacity(capacity);
                    if hub.start_collect_input_events(&mut batch, capacity) == 0 {
                        break;
                    }
                    debug!(count = batch.len(), "collected batch");
                    if tx.blocking_send(batch).is_err() {
                        debug!("batch receiver closed");
                        hub.stop_collect_input_events();
                        break;
                    }
                }
                info!("input collector stopped");
            })
            .map_err(DaemonError::Spawn)?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the hub and join the collection thread.
    pub fn stop(&self) {
        self.hub.stop_collect_input_events();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("input collector thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn add_sharing_listener(&self, listener: Arc<dyn SharingListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify(&self, affected: &AffectDhIds) {
        if affected.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_sharing_changed(affected);
        }
    }

    pub fn set_sharing_dh_ids(&self, enabled: bool, dh_ids: &[String]) -> AffectDhIds {
        let affected = self.hub.set_sharing_devices(enabled, dh_ids);
        self.notify(&affected);
        affected
    }

    pub fn set_sharing_types(&self, enabled: bool, types: InputTypes) -> AffectDhIds {
        let affected = self.hub.set_support_input_type(enabled, types);
        self.notify(&affected);
        affected
    }

    /// Have the collection thread pick up newly plugged devices.
    pub fn request_rescan(&self) {
        self.hub.request_rescan();
    }
}

impl Drop for InputCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
