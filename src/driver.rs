//! Driver-level registry of outstation sessions
//!
//! The [`Iec104Driver`] owns every [`Iec104Client`] in the process, keyed by
//! `"{ip}-{port}-{coa}"`. Readers hold the key, not the client, and look it
//! up on demand; configuration reloads add and remove entries without
//! touching anything else.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::client::{ClientStatistics, Iec104Client};
use crate::config::DeviceSettings;
use crate::error::{Iec104Error, Result};
use crate::reader::{DeviceReader, MeasurementSink};

/// Registry of all configured outstation sessions
#[derive(Default)]
pub struct Iec104Driver {
    clients: DashMap<String, Arc<Iec104Client>>,
}

impl Iec104Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its session
    ///
    /// Registering an already-known device returns the existing session
    /// untouched, so configuration reloads are idempotent.
    pub fn add_device(&self, settings: &DeviceSettings) -> Arc<Iec104Client> {
        let id = settings.device_id();
        if let Some(existing) = self.clients.get(&id) {
            warn!("device {id} already registered");
            return existing.clone();
        }
        let client = Arc::new(Iec104Client::new(settings.client_config()));
        self.clients.insert(id.clone(), client.clone());
        info!("device {id} registered");
        client
    }

    /// Remove a device, closing its link
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        match self.clients.remove(device_id) {
            Some((id, client)) => {
                client.disconnect().await;
                info!("device {id} removed");
                Ok(())
            }
            None => Err(Iec104Error::ConfigError(format!(
                "device {device_id} is not registered"
            ))),
        }
    }

    /// Look up a session by its `{ip}-{port}-{coa}` key
    pub fn client(&self, device_id: &str) -> Option<Arc<Iec104Client>> {
        self.clients.get(device_id).map(|entry| entry.clone())
    }

    /// Build a reader for a registered device
    pub fn create_reader(
        &self,
        settings: DeviceSettings,
        sink: Arc<dyn MeasurementSink>,
    ) -> Result<DeviceReader> {
        let client = self.client(&settings.device_id()).ok_or_else(|| {
            Iec104Error::ConfigError(format!("device {} is not registered", settings.device_id()))
        })?;
        Ok(DeviceReader::new(settings, client, sink))
    }

    /// Registered device keys
    pub fn device_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Session statistics for every registered device
    pub async fn statistics(&self) -> Vec<(String, ClientStatistics)> {
        let mut out = Vec::with_capacity(self.clients.len());
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (id, client) in clients {
            out.push((id, client.statistics().await));
        }
        out
    }

    /// Disconnect every session
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.clients.clear();
        for (id, client) in clients {
            client.disconnect().await;
            info!("device {id} disconnected");
        }
    }
}
