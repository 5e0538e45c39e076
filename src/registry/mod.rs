//! Presence-plane state: connected clients and the station registry.
//!
//! One process-wide [`Hub`] owns every presence connection record and every
//! live station. All mutations happen behind a single mutex held by the web
//! state, so each incoming frame's effect is applied atomically.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Canonical flat identifier: trimmed, uppercased.
pub type FlatId = String;

/// Normalize a raw flat id to its canonical form.
pub fn normalize_flat_id(raw: &str) -> FlatId {
    raw.trim().to_uppercase()
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Stable opaque handle for one presence connection.
///
/// Stations keep sets of these instead of references, so cleanup can walk
/// client -> station and station -> clients without cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Role of a presence connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Idle,
    Broadcaster,
    Listener,
}

/// Broadcaster audio telemetry, mirrored verbatim to the internal snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AudioStatus {
    #[serde(rename = "micOn")]
    pub mic_on: bool,
    #[serde(rename = "sysOn")]
    pub sys_on: bool,
    pub ptt: bool,
    pub speaking: bool,
    #[serde(rename = "micLevel")]
    pub mic_level: f64,
}

impl Default for AudioStatus {
    fn default() -> Self {
        Self {
            mic_on: false,
            sys_on: false,
            ptt: false,
            speaking: false,
            mic_level: 0.0,
        }
    }
}

/// One live station, keyed in the hub by its broadcaster's flat id.
#[derive(Debug)]
pub struct Station {
    /// Connection that started the broadcast.
    pub owner: ConnId,
    pub ip: IpAddr,
    pub started_at: DateTime<Utc>,
    pub listeners: HashSet<ConnId>,
    pub audio: AudioStatus,
}

/// One presence connection record.
#[derive(Debug)]
pub struct PresenceClient {
    pub flat_id: Option<FlatId>,
    pub ip: IpAddr,
    pub role: Role,
    pub listening_to: Option<FlatId>,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of a `broadcast:start` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyBroadcasting,
    /// Unidentified client or unknown connection; frame is dropped.
    Ignored,
}

/// Public station list entry (no IPs, no per-listener detail).
#[derive(Debug, Clone, Serialize)]
pub struct StationSummary {
    pub id: FlatId,
    pub name: FlatId,
    pub live: bool,
    pub listeners: usize,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
}

/// Internal snapshot: one listener of a station.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerDetail {
    pub flat_id: Option<FlatId>,
    pub ip: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: i64,
}

/// Internal snapshot: one station with broadcaster IP and listeners.
#[derive(Debug, Clone, Serialize)]
pub struct StationDetail {
    pub id: FlatId,
    pub ip: String,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    pub audio: AudioStatus,
    pub listeners: Vec<ListenerDetail>,
}

/// Internal snapshot: one presence connection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientDetail {
    pub flat_id: Option<FlatId>,
    pub ip: String,
    pub role: Role,
    #[serde(rename = "listeningTo")]
    pub listening_to: Option<FlatId>,
    #[serde(rename = "connectedAt")]
    pub connected_at: i64,
}

/// Presence clients and live stations, the single source of truth for
/// "who is live".
#[derive(Debug, Default)]
pub struct Hub {
    clients: HashMap<ConnId, PresenceClient>,
    stations: HashMap<FlatId, Station>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted presence connection.
    pub fn connect(&mut self, conn: ConnId, ip: IpAddr) {
        self.clients.insert(
            conn,
            PresenceClient {
                flat_id: None,
                ip,
                role: Role::Idle,
                listening_to: None,
                connected_at: Utc::now(),
            },
        );
    }

    /// Bind a connection to its canonical flat id.
    pub fn identify(&mut self, conn: ConnId, flat_id: FlatId) {
        if let Some(client) = self.clients.get_mut(&conn) {
            client.flat_id = Some(flat_id);
        }
    }

    /// Start broadcasting for the connection's flat.
    ///
    /// A second station under the same flat id is refused; the existing one
    /// is left untouched. A listening client leaves its current station
    /// first, in the same mutation.
    pub fn start_broadcast(&mut self, conn: ConnId) -> StartOutcome {
        let (flat_id, ip) = match self.clients.get(&conn) {
            Some(client) => match &client.flat_id {
                Some(flat_id) => (flat_id.clone(), client.ip),
                None => return StartOutcome::Ignored,
            },
            None => return StartOutcome::Ignored,
        };

        if self.stations.contains_key(&flat_id) {
            return StartOutcome::AlreadyBroadcasting;
        }

        self.leave_current_station(conn);

        if let Some(client) = self.clients.get_mut(&conn) {
            client.role = Role::Broadcaster;
            client.listening_to = None;
        }
        self.stations.insert(
            flat_id,
            Station {
                owner: conn,
                ip,
                started_at: Utc::now(),
                listeners: HashSet::new(),
                audio: AudioStatus::default(),
            },
        );
        StartOutcome::Started
    }

    /// Stop the station owned by the connection's flat, resetting every
    /// listener back to idle.
    pub fn stop_broadcast(&mut self, conn: ConnId) {
        let Some(flat_id) = self.clients.get(&conn).and_then(|c| c.flat_id.clone()) else {
            return;
        };
        self.remove_station(&flat_id);
        if let Some(client) = self.clients.get_mut(&conn) {
            client.role = Role::Idle;
            client.listening_to = None;
        }
    }

    /// Update audio telemetry for the connection's station, if it is live.
    pub fn update_audio(&mut self, conn: ConnId, mut audio: AudioStatus) {
        let Some(flat_id) = self.clients.get(&conn).and_then(|c| c.flat_id.clone()) else {
            return;
        };
        if let Some(station) = self.stations.get_mut(&flat_id) {
            if !audio.mic_level.is_finite() {
                audio.mic_level = 0.0;
            }
            audio.mic_level = audio.mic_level.clamp(0.0, 1.0);
            station.audio = audio;
        }
    }

    /// Start listening to `target`. Ignored for broadcasters, unidentified
    /// clients, and absent stations. Switching targets leaves the old
    /// station's listener set in the same mutation.
    pub fn start_listen(&mut self, conn: ConnId, target: FlatId) {
        match self.clients.get(&conn) {
            Some(client) if client.flat_id.is_some() && client.role != Role::Broadcaster => {}
            _ => return,
        }
        if !self.stations.contains_key(&target) {
            return;
        }

        self.leave_current_station(conn);

        if let Some(station) = self.stations.get_mut(&target) {
            station.listeners.insert(conn);
        }
        if let Some(client) = self.clients.get_mut(&conn) {
            client.role = Role::Listener;
            client.listening_to = Some(target);
        }
    }

    /// Stop listening and return to idle.
    pub fn stop_listen(&mut self, conn: ConnId) {
        self.leave_current_station(conn);
        if let Some(client) = self.clients.get_mut(&conn) {
            if client.role == Role::Listener {
                client.role = Role::Idle;
            }
            client.listening_to = None;
        }
    }

    /// Release everything the connection holds. Safe to call more than once.
    pub fn disconnect(&mut self, conn: ConnId) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        match client.role {
            Role::Listener => self.leave_current_station(conn),
            Role::Broadcaster => {
                if let Some(flat_id) = client.flat_id.clone() {
                    self.remove_station(&flat_id);
                }
            }
            Role::Idle => {}
        }
        self.clients.remove(&conn);
    }

    /// Whether a station is live under this flat id.
    pub fn station_live(&self, flat_id: &str) -> bool {
        self.stations.contains_key(flat_id)
    }

    /// Public station list, sorted by flat id ascending.
    pub fn public_stations(&self) -> Vec<StationSummary> {
        let mut list: Vec<StationSummary> = self
            .stations
            .iter()
            .map(|(flat_id, station)| StationSummary {
                id: flat_id.clone(),
                name: flat_id.clone(),
                live: true,
                listeners: station.listeners.len(),
                started_at: station.started_at.timestamp_millis(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Full station detail for the token-gated internal snapshot.
    pub fn station_details(&self) -> Vec<StationDetail> {
        let mut list: Vec<StationDetail> = self
            .stations
            .iter()
            .map(|(flat_id, station)| StationDetail {
                id: flat_id.clone(),
                ip: station.ip.to_string(),
                started_at: station.started_at.timestamp_millis(),
                audio: station.audio.clone(),
                listeners: station
                    .listeners
                    .iter()
                    .filter_map(|conn| self.clients.get(conn))
                    .map(|client| ListenerDetail {
                        flat_id: client.flat_id.clone(),
                        ip: client.ip.to_string(),
                        connected_at: client.connected_at.timestamp_millis(),
                    })
                    .collect(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Flat list of all presence connections for the internal snapshot.
    pub fn client_details(&self) -> Vec<ClientDetail> {
        self.clients
            .values()
            .map(|client| ClientDetail {
                flat_id: client.flat_id.clone(),
                ip: client.ip.to_string(),
                role: client.role,
                listening_to: client.listening_to.clone(),
                connected_at: client.connected_at.timestamp_millis(),
            })
            .collect()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn listener_count(&self) -> usize {
        self.stations.values().map(|s| s.listeners.len()).sum()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Drop the connection from whatever listener set it is in.
    fn leave_current_station(&mut self, conn: ConnId) {
        let Some(target) = self.clients.get(&conn).and_then(|c| c.listening_to.clone()) else {
            return;
        };
        if let Some(station) = self.stations.get_mut(&target) {
            station.listeners.remove(&conn);
        }
    }

    /// Delete a station and reset all of its listeners to idle.
    fn remove_station(&mut self, flat_id: &str) {
        let Some(station) = self.stations.remove(flat_id) else {
            return;
        };
        for listener in station.listeners {
            if let Some(client) = self.clients.get_mut(&listener) {
                client.role = Role::Idle;
                client.listening_to = None;
            }
        }
        if let Some(owner) = self.clients.get_mut(&station.owner) {
            if owner.role == Role::Broadcaster {
                owner.role = Role::Idle;
            }
        }
    }

    #[cfg(test)]
    fn client(&self, conn: ConnId) -> &PresenceClient {
        self.clients.get(&conn).expect("client registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn identified(hub: &mut Hub, flat: &str) -> ConnId {
        let conn = ConnId::next();
        hub.connect(conn, ip());
        hub.identify(conn, normalize_flat_id(flat));
        conn
    }

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(normalize_flat_id("  ab12  "), "AB12");
        assert_eq!(normalize_flat_id("a1"), "A1");
    }

    #[test]
    fn start_broadcast_requires_identify() {
        let mut hub = Hub::new();
        let conn = ConnId::next();
        hub.connect(conn, ip());
        assert_eq!(hub.start_broadcast(conn), StartOutcome::Ignored);
        assert_eq!(hub.station_count(), 0);
    }

    #[test]
    fn single_station_per_flat() {
        let mut hub = Hub::new();
        let first = identified(&mut hub, "a1");
        let second = identified(&mut hub, " A1 ");

        assert_eq!(hub.start_broadcast(first), StartOutcome::Started);
        assert_eq!(hub.start_broadcast(second), StartOutcome::AlreadyBroadcasting);
        assert_eq!(hub.station_count(), 1);
        assert_eq!(hub.client(first).role, Role::Broadcaster);
        assert_eq!(hub.client(second).role, Role::Idle);
    }

    #[test]
    fn start_then_stop_restores_idle() {
        let mut hub = Hub::new();
        let conn = identified(&mut hub, "a1");

        hub.start_broadcast(conn);
        hub.stop_broadcast(conn);

        assert_eq!(hub.station_count(), 0);
        assert_eq!(hub.client(conn).role, Role::Idle);
        assert!(hub.client(conn).listening_to.is_none());
    }

    #[test]
    fn listener_joins_and_leaves() {
        let mut hub = Hub::new();
        let b = identified(&mut hub, "a1");
        let l = identified(&mut hub, "b2");
        hub.start_broadcast(b);

        hub.start_listen(l, "A1".to_string());
        assert_eq!(hub.client(l).role, Role::Listener);
        assert_eq!(hub.client(l).listening_to.as_deref(), Some("A1"));
        assert_eq!(hub.listener_count(), 1);

        hub.stop_listen(l);
        assert_eq!(hub.client(l).role, Role::Idle);
        assert!(hub.client(l).listening_to.is_none());
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn listen_to_absent_station_is_ignored() {
        let mut hub = Hub::new();
        let l = identified(&mut hub, "b2");
        hub.start_listen(l, "A1".to_string());
        assert_eq!(hub.client(l).role, Role::Idle);
    }

    #[test]
    fn broadcaster_cannot_listen() {
        let mut hub = Hub::new();
        let a = identified(&mut hub, "a1");
        let b = identified(&mut hub, "b2");
        hub.start_broadcast(a);
        hub.start_broadcast(b);

        hub.start_listen(a, "B2".to_string());
        assert_eq!(hub.client(a).role, Role::Broadcaster);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn switching_target_moves_listener_atomically() {
        let mut hub = Hub::new();
        let a = identified(&mut hub, "a1");
        let b = identified(&mut hub, "b2");
        let l = identified(&mut hub, "c3");
        hub.start_broadcast(a);
        hub.start_broadcast(b);

        hub.start_listen(l, "A1".to_string());
        hub.start_listen(l, "B2".to_string());

        let summaries = hub.public_stations();
        assert_eq!(summaries[0].id, "A1");
        assert_eq!(summaries[0].listeners, 0);
        assert_eq!(summaries[1].id, "B2");
        assert_eq!(summaries[1].listeners, 1);
        assert_eq!(hub.client(l).listening_to.as_deref(), Some("B2"));
    }

    #[test]
    fn listener_starting_broadcast_leaves_old_station() {
        let mut hub = Hub::new();
        let a = identified(&mut hub, "a1");
        let l = identified(&mut hub, "b2");
        hub.start_broadcast(a);
        hub.start_listen(l, "A1".to_string());

        assert_eq!(hub.start_broadcast(l), StartOutcome::Started);
        assert_eq!(hub.client(l).role, Role::Broadcaster);
        assert!(hub.client(l).listening_to.is_none());
        let summaries = hub.public_stations();
        assert_eq!(summaries[0].listeners, 0);
    }

    #[test]
    fn stop_broadcast_resets_listeners() {
        let mut hub = Hub::new();
        let b = identified(&mut hub, "a1");
        let l1 = identified(&mut hub, "b2");
        let l2 = identified(&mut hub, "c3");
        hub.start_broadcast(b);
        hub.start_listen(l1, "A1".to_string());
        hub.start_listen(l2, "A1".to_string());

        hub.stop_broadcast(b);

        assert_eq!(hub.station_count(), 0);
        for conn in [l1, l2] {
            assert_eq!(hub.client(conn).role, Role::Idle);
            assert!(hub.client(conn).listening_to.is_none());
        }
    }

    #[test]
    fn broadcaster_disconnect_cleans_up_like_stop() {
        let mut hub = Hub::new();
        let b = identified(&mut hub, "a1");
        let l1 = identified(&mut hub, "b2");
        let l2 = identified(&mut hub, "c3");
        hub.start_broadcast(b);
        hub.start_listen(l1, "A1".to_string());
        hub.start_listen(l2, "A1".to_string());

        hub.disconnect(b);

        assert_eq!(hub.station_count(), 0);
        assert_eq!(hub.client_count(), 2);
        for conn in [l1, l2] {
            assert_eq!(hub.client(conn).role, Role::Idle);
            assert!(hub.client(conn).listening_to.is_none());
        }
    }

    #[test]
    fn listener_disconnect_shrinks_listener_set() {
        let mut hub = Hub::new();
        let b = identified(&mut hub, "a1");
        let l = identified(&mut hub, "b2");
        hub.start_broadcast(b);
        hub.start_listen(l, "A1".to_string());

        hub.disconnect(l);

        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut hub = Hub::new();
        let conn = identified(&mut hub, "a1");
        hub.start_broadcast(conn);
        hub.disconnect(conn);
        hub.disconnect(conn);
        assert_eq!(hub.station_count(), 0);
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn audio_update_requires_live_station() {
        let mut hub = Hub::new();
        let conn = identified(&mut hub, "a1");
        hub.update_audio(
            conn,
            AudioStatus {
                mic_on: true,
                ..AudioStatus::default()
            },
        );
        assert_eq!(hub.station_count(), 0);

        hub.start_broadcast(conn);
        hub.update_audio(
            conn,
            AudioStatus {
                mic_on: true,
                mic_level: 0.5,
                ..AudioStatus::default()
            },
        );
        let details = hub.station_details();
        assert!(details[0].audio.mic_on);
        assert_eq!(details[0].audio.mic_level, 0.5);
    }

    #[test]
    fn mic_level_is_clamped() {
        let mut hub = Hub::new();
        let conn = identified(&mut hub, "a1");
        hub.start_broadcast(conn);

        hub.update_audio(
            conn,
            AudioStatus {
                mic_level: 3.5,
                ..AudioStatus::default()
            },
        );
        assert_eq!(hub.station_details()[0].audio.mic_level, 1.0);

        hub.update_audio(
            conn,
            AudioStatus {
                mic_level: f64::NAN,
                ..AudioStatus::default()
            },
        );
        assert_eq!(hub.station_details()[0].audio.mic_level, 0.0);
    }

    #[test]
    fn public_list_hides_detail_snapshot_shows_it() {
        let mut hub = Hub::new();
        let b = identified(&mut hub, "a1");
        let l = identified(&mut hub, "b2");
        hub.start_broadcast(b);
        hub.start_listen(l, "A1".to_string());

        let public = serde_json::to_value(hub.public_stations()).unwrap();
        let rendered = public.to_string();
        assert!(!rendered.contains("127.0.0.1"));
        assert!(rendered.contains("\"listeners\":1"));

        let details = hub.station_details();
        assert_eq!(details[0].ip, "127.0.0.1");
        assert_eq!(details[0].listeners.len(), 1);
        assert_eq!(details[0].listeners[0].flat_id.as_deref(), Some("B2"));
    }
}
