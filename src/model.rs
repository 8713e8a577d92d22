//! Client-side world model populated by the post-connect handshake.
//!
//! Everything in here is server-derived state: it is filled in by the
//! bootstrap sequence and by push notifications while a connection is alive,
//! and wiped as a whole when the connection is lost for good. The only
//! exceptions are the local show settings, which belong to the client, and
//! the "actively connecting" marker, which is cleared separately under the
//! URL guard of the disconnection classifier.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Connection status entry reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub id: String,
    pub purpose: Option<String>,
    pub status: Option<String>,
}

/// Clock entry reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockInfo {
    #[serde(default)]
    pub id: String,
    pub epoch: Option<String>,
    pub running: Option<bool>,
    pub ticks_per_second: Option<f64>,
}

/// Docking station entry reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockInfo {
    #[serde(default)]
    pub id: String,
    pub position: Option<Value>,
}

/// Beacon entry reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconInfo {
    #[serde(default)]
    pub id: String,
    pub position: Option<Value>,
    pub active: Option<bool>,
}

/// Shared world model, keyed maps concurrent, scalars behind locks.
#[derive(Debug, Default)]
pub struct WorldModel {
    version: RwLock<Option<String>>,
    connections: DashMap<String, ConnectionInfo>,
    clocks: DashMap<String, ClockInfo>,
    docks: DashMap<String, DockInfo>,
    beacons: DashMap<String, BeaconInfo>,
    beacon_properties: DashMap<String, Value>,
    features: RwLock<HashSet<String>>,
    license: RwLock<Option<Value>>,
    show_synced: AtomicBool,
    local_show_settings: RwLock<Option<Value>>,
    weather: RwLock<Option<Value>>,
    clock_skew_ms: RwLock<Option<i64>>,
    time_sync_dialog_open: AtomicBool,
    connecting_url: RwLock<Option<String>>,
}

impl WorldModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_version(&self, version: Option<String>) {
        *self.version.write().await = version;
    }

    pub async fn version(&self) -> Option<String> {
        self.version.read().await.clone()
    }

    /// Replace the whole connection map with a fresh snapshot
    pub fn replace_connections(&self, entries: impl IntoIterator<Item = (String, ConnectionInfo)>) {
        self.connections.clear();
        for (id, info) in entries {
            self.connections.insert(id, info);
        }
    }

    pub fn upsert_connection(&self, id: String, info: ConnectionInfo) {
        self.connections.insert(id, info);
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn replace_clocks(&self, entries: impl IntoIterator<Item = (String, ClockInfo)>) {
        self.clocks.clear();
        for (id, info) in entries {
            self.clocks.insert(id, info);
        }
    }

    pub fn upsert_clock(&self, id: String, info: ClockInfo) {
        self.clocks.insert(id, info);
    }

    pub fn clock(&self, id: &str) -> Option<ClockInfo> {
        self.clocks.get(id).map(|e| e.value().clone())
    }

    pub fn clock_count(&self) -> usize {
        self.clocks.len()
    }

    pub fn replace_docks(&self, entries: impl IntoIterator<Item = (String, DockInfo)>) {
        self.docks.clear();
        for (id, info) in entries {
            self.docks.insert(id, info);
        }
    }

    pub fn upsert_dock(&self, id: String, info: DockInfo) {
        self.docks.insert(id, info);
    }

    pub fn dock_count(&self) -> usize {
        self.docks.len()
    }

    pub fn replace_beacons(&self, entries: impl IntoIterator<Item = (String, BeaconInfo)>) {
        self.beacons.clear();
        for (id, info) in entries {
            self.beacons.insert(id, info);
        }
    }

    pub fn upsert_beacon(&self, id: String, info: BeaconInfo) {
        self.beacons.insert(id, info);
    }

    pub fn beacon_count(&self) -> usize {
        self.beacons.len()
    }

    pub fn set_beacon_properties(&self, id: String, properties: Value) {
        self.beacon_properties.insert(id, properties);
    }

    pub fn beacon_properties(&self, id: &str) -> Option<Value> {
        self.beacon_properties.get(id).map(|e| e.value().clone())
    }

    pub async fn add_feature(&self, name: impl Into<String>) {
        self.features.write().await.insert(name.into());
    }

    pub async fn has_feature(&self, name: &str) -> bool {
        self.features.read().await.contains(name)
    }

    pub async fn features(&self) -> HashSet<String> {
        self.features.read().await.clone()
    }

    pub async fn set_license(&self, license: Option<Value>) {
        *self.license.write().await = license;
    }

    pub async fn license(&self) -> Option<Value> {
        self.license.read().await.clone()
    }

    pub fn mark_show_synced(&self, synced: bool) {
        self.show_synced.store(synced, Ordering::SeqCst);
    }

    pub fn show_synced(&self) -> bool {
        self.show_synced.load(Ordering::SeqCst)
    }

    pub async fn set_local_show_settings(&self, settings: Option<Value>) {
        *self.local_show_settings.write().await = settings;
    }

    pub async fn local_show_settings(&self) -> Option<Value> {
        self.local_show_settings.read().await.clone()
    }

    pub async fn set_weather(&self, weather: Option<Value>) {
        *self.weather.write().await = weather;
    }

    pub async fn weather(&self) -> Option<Value> {
        self.weather.read().await.clone()
    }

    pub async fn set_clock_skew_ms(&self, skew: Option<i64>) {
        *self.clock_skew_ms.write().await = skew;
    }

    pub async fn clock_skew_ms(&self) -> Option<i64> {
        *self.clock_skew_ms.read().await
    }

    pub fn set_time_sync_dialog_open(&self, open: bool) {
        self.time_sync_dialog_open.store(open, Ordering::SeqCst);
    }

    pub fn time_sync_dialog_open(&self) -> bool {
        self.time_sync_dialog_open.load(Ordering::SeqCst)
    }

    /// Mark the URL we are actively trying to reach, or clear it with `None`.
    pub async fn set_connecting_url(&self, url: Option<String>) {
        *self.connecting_url.write().await = url;
    }

    pub async fn connecting_url(&self) -> Option<String> {
        self.connecting_url.read().await.clone()
    }

    /// Wipe every piece of server-derived state.
    ///
    /// Local show settings and the connecting-URL marker survive; the marker
    /// is cleared separately, guarded by the URL check of the classifier.
    pub async fn clear_server_state(&self) {
        *self.version.write().await = None;
        self.connections.clear();
        self.clocks.clear();
        self.docks.clear();
        self.beacons.clear();
        self.beacon_properties.clear();
        self.features.write().await.clear();
        *self.license.write().await = None;
        self.show_synced.store(false, Ordering::SeqCst);
        *self.weather.write().await = None;
        *self.clock_skew_ms.write().await = None;
        self.time_sync_dialog_open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_connection(id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            purpose: Some("gps".to_string()),
            status: Some("connected".to_string()),
        }
    }

    #[tokio::test]
    async fn test_clear_server_state() {
        let model = WorldModel::new();
        model.set_version(Some("2.1.0".to_string())).await;
        model.upsert_connection("gps".to_string(), sample_connection("gps"));
        model.upsert_clock(
            "system".to_string(),
            ClockInfo {
                id: "system".to_string(),
                epoch: None,
                running: Some(true),
                ticks_per_second: Some(1000.0),
            },
        );
        model.add_feature("show").await;
        model.set_license(Some(json!({"id": "LIC-1"}))).await;
        model.mark_show_synced(true);
        model.set_clock_skew_ms(Some(1500)).await;
        model.set_time_sync_dialog_open(true);
        model.set_connecting_url(Some("ws://a:1".to_string())).await;
        model
            .set_local_show_settings(Some(json!({"start": "auto"})))
            .await;

        model.clear_server_state().await;

        assert_eq!(model.version().await, None);
        assert_eq!(model.connection_count(), 0);
        assert_eq!(model.clock_count(), 0);
        assert!(!model.has_feature("show").await);
        assert_eq!(model.license().await, None);
        assert!(!model.show_synced());
        assert_eq!(model.clock_skew_ms().await, None);
        assert!(!model.time_sync_dialog_open());

        // local data and the connecting marker are not server-derived
        assert!(model.local_show_settings().await.is_some());
        assert_eq!(model.connecting_url().await, Some("ws://a:1".to_string()));
    }

    #[tokio::test]
    async fn test_replace_is_a_snapshot() {
        let model = WorldModel::new();
        model.upsert_connection("old".to_string(), sample_connection("old"));
        model.replace_connections(vec![("new".to_string(), sample_connection("new"))]);
        assert!(model.connection("old").is_none());
        assert!(model.connection("new").is_some());
        assert_eq!(model.connection_count(), 1);
    }
}
