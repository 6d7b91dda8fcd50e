//! Listener registry with privilege redaction
//!
//! Listeners register with a cookie describing who they are; every
//! broadcast builds a per-listener view, hiding soft-AP configuration
//! from listeners that neither own the request nor hold system privilege
//! and dropping client lists for unprivileged listeners entirely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TetherResultCode;
use crate::net::{DownstreamType, Network, SoftApConfig};
use crate::offload::OffloadStatus;

/// Identity attached to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerCookie {
    pub uid: u32,
    /// Holds NETWORK_SETTINGS / NETWORK_STACK.
    pub privileged: bool,
}

/// Handle returned by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Serving state of one downstream as exposed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamStateKind {
    Available,
    Tethered,
    LocalOnly,
}

/// One downstream row in the states broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamState {
    pub iface: String,
    pub tethering_type: DownstreamType,
    pub state: DownstreamStateKind,
    pub last_error: TetherResultCode,
    /// Present only for the Wi-Fi downstream; redacted per listener.
    #[serde(default)]
    pub soft_ap_config: Option<SoftApConfig>,
    /// Uid that created the active request, when one exists.
    #[serde(default)]
    pub request_uid: Option<u32>,
}

/// A connected downstream client (privileged listeners only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetheredClient {
    pub mac: String,
    pub address: Option<std::net::IpAddr>,
    pub tethering_type: DownstreamType,
}

/// Events fanned out to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallbackEvent {
    SupportedTypesChanged { bitmap: u32 },
    UpstreamChanged { network: Option<Network> },
    ConfigurationChanged { supported_bitmap: u32, provisioning_required: bool },
    TetherStatesChanged { states: Vec<DownstreamState> },
    ClientsChanged { clients: Vec<TetheredClient> },
    OffloadStatusChanged { status: OffloadStatus },
}

/// Where redacted events are delivered.
pub trait EventCallbackSink: Send + Sync {
    fn on_event(&self, event: &CallbackEvent);
}

/// Sink that forwards events over a channel, used by the IPC layer and
/// tests.
pub struct ChannelCallbackSink(pub mpsc::UnboundedSender<CallbackEvent>);

impl EventCallbackSink for ChannelCallbackSink {
    fn on_event(&self, event: &CallbackEvent) {
        let _ = self.0.send(event.clone());
    }
}

struct Listener {
    id: ListenerId,
    cookie: ListenerCookie,
    sink: Arc<dyn EventCallbackSink>,
}

/// Serializes broadcasts so every listener observes a consistent
/// sequence of snapshots.
#[derive(Default)]
pub struct CallbackRegistry {
    listeners: Vec<Listener>,
    next_id: u64,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        cookie: ListenerCookie,
        sink: Arc<dyn EventCallbackSink>,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        debug!("listener {id:?} registered (uid {})", cookie.uid);
        self.listeners.push(Listener { id, cookie, sink });
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        before != self.listeners.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn broadcast_supported_types(&self, bitmap: u32) {
        self.broadcast(&CallbackEvent::SupportedTypesChanged { bitmap });
    }

    pub fn broadcast_upstream_changed(&self, network: Option<Network>) {
        self.broadcast(&CallbackEvent::UpstreamChanged { network });
    }

    pub fn broadcast_configuration(&self, supported_bitmap: u32, provisioning_required: bool) {
        self.broadcast(&CallbackEvent::ConfigurationChanged {
            supported_bitmap,
            provisioning_required,
        });
    }

    pub fn broadcast_offload_status(&self, status: OffloadStatus) {
        self.broadcast(&CallbackEvent::OffloadStatusChanged { status });
    }

    /// Per-listener redacted view of the downstream states.
    pub fn broadcast_tether_states(&self, states: &[DownstreamState]) {
        for listener in &self.listeners {
            let event = CallbackEvent::TetherStatesChanged {
                states: redact_states(states, listener.cookie),
            };
            listener.sink.on_event(&event);
        }
    }

    /// Client lists carry MAC and IP addresses; privileged only.
    pub fn broadcast_clients(&self, clients: &[TetheredClient]) {
        let event = CallbackEvent::ClientsChanged {
            clients: clients.to_vec(),
        };
        for listener in &self.listeners {
            if listener.cookie.privileged {
                listener.sink.on_event(&event);
            }
        }
    }

    /// Deliver an event to one listener (initial replay on register).
    pub fn notify_one(&self, id: ListenerId, event: &CallbackEvent) {
        let Some(listener) = self.listeners.iter().find(|l| l.id == id) else {
            return;
        };
        match event {
            CallbackEvent::TetherStatesChanged { states } => {
                listener.sink.on_event(&CallbackEvent::TetherStatesChanged {
                    states: redact_states(states, listener.cookie),
                });
            }
            CallbackEvent::ClientsChanged { .. } if !listener.cookie.privileged => {}
            other => listener.sink.on_event(other),
        }
    }

    fn broadcast(&self, event: &CallbackEvent) {
        for listener in &self.listeners {
            listener.sink.on_event(event);
        }
    }
}

/// Soft-AP config is visible to the owner of the request and to
/// privileged listeners; everyone else gets the row without it.
fn redact_states(states: &[DownstreamState], cookie: ListenerCookie) -> Vec<DownstreamState> {
    states
        .iter()
        .map(|state| {
            let visible =
                cookie.privileged || state.request_uid == Some(cookie.uid);
            let mut state = state.clone();
            if !visible {
                state.soft_ap_config = None;
            }
            state
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (Arc<ChannelCallbackSink>, mpsc::UnboundedReceiver<CallbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelCallbackSink(tx)), rx)
    }

    fn wifi_state(request_uid: u32) -> DownstreamState {
        DownstreamState {
            iface: "wlan0".into(),
            tethering_type: DownstreamType::Wifi,
            state: DownstreamStateKind::Tethered,
            last_error: TetherResultCode::NoError,
            soft_ap_config: Some(SoftApConfig {
                ssid: "gateway".into(),
                passphrase: Some("hunter2".into()),
            }),
            request_uid: Some(request_uid),
        }
    }

    #[test]
    fn soft_ap_config_redacted_for_strangers() {
        let mut registry = CallbackRegistry::new();
        let (owner_sink, mut owner_rx) = sink();
        let (stranger_sink, mut stranger_rx) = sink();
        let (priv_sink, mut priv_rx) = sink();

        registry.register(ListenerCookie { uid: 1000, privileged: false }, owner_sink);
        registry.register(ListenerCookie { uid: 2000, privileged: false }, stranger_sink);
        registry.register(ListenerCookie { uid: 3000, privileged: true }, priv_sink);

        registry.broadcast_tether_states(&[wifi_state(1000)]);

        let owner_view = owner_rx.try_recv().unwrap();
        let CallbackEvent::TetherStatesChanged { states } = owner_view else {
            panic!("wrong event")
        };
        assert!(states[0].soft_ap_config.is_some());

        let stranger_view = stranger_rx.try_recv().unwrap();
        let CallbackEvent::TetherStatesChanged { states } = stranger_view else {
            panic!("wrong event")
        };
        assert!(states[0].soft_ap_config.is_none());

        let priv_view = priv_rx.try_recv().unwrap();
        let CallbackEvent::TetherStatesChanged { states } = priv_view else {
            panic!("wrong event")
        };
        assert!(states[0].soft_ap_config.is_some());
    }

    #[test]
    fn clients_are_privileged_only() {
        let mut registry = CallbackRegistry::new();
        let (plain_sink, mut plain_rx) = sink();
        let (priv_sink, mut priv_rx) = sink();

        registry.register(ListenerCookie { uid: 1000, privileged: false }, plain_sink);
        registry.register(ListenerCookie { uid: 1000, privileged: true }, priv_sink);

        registry.broadcast_clients(&[TetheredClient {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            address: None,
            tethering_type: DownstreamType::Wifi,
        }]);

        assert!(plain_rx.try_recv().is_err());
        assert!(matches!(
            priv_rx.try_recv().unwrap(),
            CallbackEvent::ClientsChanged { .. }
        ));
    }

    #[test]
    fn unregister_stops_delivery() {
        let mut registry = CallbackRegistry::new();
        let (s, mut rx) = sink();
        let id = registry.register(ListenerCookie { uid: 1, privileged: false }, s);

        registry.broadcast_supported_types(0b11);
        assert!(rx.try_recv().is_ok());

        assert!(registry.unregister(id));
        registry.broadcast_supported_types(0b01);
        assert!(rx.try_recv().is_err());

        assert!(!registry.unregister(id));
    }

    #[test]
    fn notify_one_applies_redaction() {
        let mut registry = CallbackRegistry::new();
        let (s, mut rx) = sink();
        let id = registry.register(ListenerCookie { uid: 42, privileged: false }, s);

        registry.notify_one(
            id,
            &CallbackEvent::TetherStatesChanged {
                states: vec![wifi_state(7)],
            },
        );
        let CallbackEvent::TetherStatesChanged { states } = rx.try_recv().unwrap() else {
            panic!("wrong event")
        };
        assert!(states[0].soft_ap_config.is_none());
    }
}
