//! Periodic device reader: polling, interrogation scheduling, status
//!
//! A [`DeviceReader`] drives one [`Iec104Client`] on a fixed interval. Every
//! pass reconnects a broken link (rate-limited by the client's backoff),
//! drains the spontaneous queue into the host's [`MeasurementSink`], polls
//! read-mode blocks, and issues a general interrogation when one is due.
//! Commands submitted from outside go straight through [`DeviceReader::
//! send_command`] and do not wait for the poll timer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{CommandValue, Iec104Client, PointUpdate};
use crate::config::{BlockMode, DeviceSettings};
use crate::error::Result;

/// Destination for decoded information objects
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn store(&self, updates: Vec<PointUpdate>);
}

/// Snapshot of reader health for diagnostics surfaces
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderStatus {
    pub is_running: bool,
    pub is_connected: bool,
    pub read_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_read_time: Option<DateTime<Utc>>,
    pub last_interrogation_time: Option<DateTime<Utc>>,
}

/// Periodic poller for one outstation
pub struct DeviceReader {
    settings: DeviceSettings,
    client: Arc<Iec104Client>,
    sink: Arc<dyn MeasurementSink>,
    status: Arc<RwLock<ReaderStatus>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceReader {
    pub fn new(
        settings: DeviceSettings,
        client: Arc<Iec104Client>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            settings,
            client,
            sink,
            status: Arc::new(RwLock::new(ReaderStatus::default())),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Start the poll loop. Idempotent.
    pub async fn start(&self) {
        let mut task_slot = self.task.lock().await;
        if task_slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        info!("{} reader starting", self.settings.device_id());

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);
        self.status.write().await.is_running = true;

        let worker = PollWorker {
            settings: self.settings.clone(),
            client: self.client.clone(),
            sink: self.sink.clone(),
            status: self.status.clone(),
        };
        *task_slot = Some(tokio::spawn(worker.run(stop_rx)));
    }

    /// Stop the poll loop and disconnect. Idempotent.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().await.take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.client.disconnect().await;
        self.status.write().await.is_running = false;
        info!("{} reader stopped", self.settings.device_id());
    }

    /// Current reader health, with the live link state folded in
    pub async fn status(&self) -> ReaderStatus {
        let mut status = self.status.read().await.clone();
        status.is_connected = self.client.is_connected().await;
        status
    }

    /// Submit a control command immediately, bypassing the poll timer
    pub async fn send_command(
        &self,
        object_addr: u32,
        value: CommandValue,
        select_before_execute: bool,
    ) -> Result<()> {
        self.client
            .send_command(object_addr, value, select_before_execute)
            .await
    }

    /// Issue an out-of-schedule interrogation
    pub async fn send_interrogation(&self) -> Result<()> {
        let result = self.client.send_interrogation(self.settings.interrogation_qoi).await;
        if result.is_ok() {
            self.status.write().await.last_interrogation_time = Some(Utc::now());
        }
        result
    }
}

struct PollWorker {
    settings: DeviceSettings,
    client: Arc<Iec104Client>,
    sink: Arc<dyn MeasurementSink>,
    status: Arc<RwLock<ReaderStatus>>,
}

impl PollWorker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self
            .settings
            .read_interval
            .max(std::time::Duration::from_millis(10));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} poll loop exited", self.settings.device_id());
    }

    async fn poll_once(&self) {
        if let Err(e) = self.client.ensure_connected().await {
            let mut status = self.status.write().await;
            status.error_count += 1;
            status.last_error = Some(e.to_string());
            return;
        }

        let updates = self.client.process_spontaneous().await;
        if !updates.is_empty() {
            debug!(
                "{} delivering {} updates",
                self.settings.device_id(),
                updates.len()
            );
            self.sink.store(updates).await;
        }

        self.poll_read_blocks().await;
        self.interrogate_if_due().await;

        let mut status = self.status.write().await;
        status.read_count += 1;
        status.last_read_time = Some(Utc::now());
    }

    async fn poll_read_blocks(&self) {
        for block in self
            .settings
            .blocks
            .iter()
            .filter(|b| b.mode == BlockMode::Read)
        {
            for object_addr in block.addresses() {
                if let Err(e) = self.client.send_read_command(object_addr).await {
                    warn!(
                        "{} read of {object_addr} failed: {e}",
                        self.settings.device_id()
                    );
                    let mut status = self.status.write().await;
                    status.error_count += 1;
                    status.last_error = Some(e.to_string());
                    return; // link trouble; retry next pass
                }
            }
        }
    }

    async fn interrogate_if_due(&self) {
        if self.settings.interrogation_interval.is_zero() {
            return;
        }
        let due = {
            let status = self.status.read().await;
            match status.last_interrogation_time {
                None => true,
                Some(last) => {
                    let elapsed = Utc::now().signed_duration_since(last);
                    elapsed.num_milliseconds() as u128
                        >= self.settings.interrogation_interval.as_millis()
                }
            }
        };
        if !due {
            return;
        }

        // Record the attempt first so a silent outstation is not hammered
        // every poll pass.
        self.status.write().await.last_interrogation_time = Some(Utc::now());
        match self
            .client
            .send_interrogation(self.settings.interrogation_qoi)
            .await
        {
            Ok(()) => debug!("{} interrogation confirmed", self.settings.device_id()),
            Err(e) => {
                warn!("{} interrogation failed: {e}", self.settings.device_id());
                let mut status = self.status.write().await;
                status.error_count += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }
}
