//! Lightweight bridge for reporting datagram state/traffic to an optional listener.
//!
//! Counters are updated lock-free on the hot path by the queue, the pumps and
//! the dispatcher. A `TunnelInfoBridge` serializes snapshots of them (or state
//! changes) to JSON and hands them to whatever listener the embedder installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Serialize, Default, Clone, Debug, PartialEq, Eq)]
/// Point-in-time copy of the datagram counters.
pub struct DatagramTraffic {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub tx_dgrams: u64,
    pub rx_dgrams: u64,
    /// Inbound datagrams dropped because a receive buffer was full.
    pub dropped_dgrams: u64,
    /// Outbound frames discarded after exhausting their peek budget.
    pub discarded_dgrams: u64,
    pub active_sessions: u64,
}

/// Shared atomic counters behind `DatagramTraffic`.
#[derive(Default, Debug)]
pub struct TrafficCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dgrams: AtomicU64,
    rx_dgrams: AtomicU64,
    dropped_dgrams: AtomicU64,
    discarded_dgrams: AtomicU64,
    active_sessions: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on_sent(&self, len: usize) {
        self.tx_dgrams.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_received(&self, len: usize) {
        self.rx_dgrams.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_dropped(&self) {
        self.dropped_dgrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_discarded(&self) {
        self.discarded_dgrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_session_released(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DatagramTraffic {
        DatagramTraffic {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dgrams: self.tx_dgrams.load(Ordering::Relaxed),
            rx_dgrams: self.rx_dgrams.load(Ordering::Relaxed),
            dropped_dgrams: self.dropped_dgrams.load(Ordering::Relaxed),
            discarded_dgrams: self.discarded_dgrams.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a dispatcher, as reported to the listener.
pub enum DispatchState {
    Running,
    Closed,
}

#[derive(Serialize)]
/// Discriminator for the type of info carried in TunnelInfo.
pub(crate) enum TunnelInfoType {
    DispatchState,
    DatagramTraffic,
}

#[derive(Serialize)]
/// A serializable wrapper carrying a typed info payload for reporting.
pub(crate) struct TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub info_type: TunnelInfoType,
    pub data: Box<T>,
}

impl<T> TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub(crate) fn new(info_type: TunnelInfoType, data: Box<T>) -> Self {
        Self { info_type, data }
    }
}

type Listener = Arc<Mutex<dyn FnMut(&str) + 'static + Send>>;

#[derive(Clone, Default)]
/// Posts serialized datagram info to a user-provided listener, if installed.
pub struct TunnelInfoBridge {
    listener: Option<Listener>,
}

impl TunnelInfoBridge {
    pub fn new() -> Self {
        TunnelInfoBridge { listener: None }
    }

    /// Install a listener that will receive JSON-serialized TunnelInfo payloads.
    pub fn set_listener(&mut self, listener: impl FnMut(&str) + 'static + Send) {
        self.listener = Some(Arc::new(Mutex::new(listener)));
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    pub(crate) fn post_state(&self, state: DispatchState) {
        self.post_tunnel_info(TunnelInfo::new(TunnelInfoType::DispatchState, Box::new(state)));
    }

    pub(crate) fn post_traffic(&self, traffic: DatagramTraffic) {
        self.post_tunnel_info(TunnelInfo::new(
            TunnelInfoType::DatagramTraffic,
            Box::new(traffic),
        ));
    }

    fn post_tunnel_info<T>(&self, data: TunnelInfo<T>)
    where
        T: ?Sized + Serialize,
    {
        if let Some(ref listener) = self.listener {
            match serde_json::to_string(&data) {
                Ok(json) => {
                    let mut listener = listener.lock();
                    (*listener)(json.as_str())
                }
                Err(e) => log::warn!("failed to serialize tunnel info: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = TrafficCounters::new();
        counters.on_sent(10);
        counters.on_sent(5);
        counters.on_received(7);
        counters.on_dropped();
        counters.on_session_opened();
        counters.on_session_opened();
        counters.on_session_released();

        let traffic = counters.snapshot();
        assert_eq!(traffic.tx_dgrams, 2);
        assert_eq!(traffic.tx_bytes, 15);
        assert_eq!(traffic.rx_dgrams, 1);
        assert_eq!(traffic.rx_bytes, 7);
        assert_eq!(traffic.dropped_dgrams, 1);
        assert_eq!(traffic.discarded_dgrams, 0);
        assert_eq!(traffic.active_sessions, 1);
    }

    #[test]
    fn test_bridge_posts_json() {
        let posted = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut bridge = TunnelInfoBridge::new();
        assert!(!bridge.has_listener());
        {
            let posted = posted.clone();
            bridge.set_listener(move |json| posted.lock().push(json.to_string()));
        }
        assert!(bridge.has_listener());

        bridge.post_state(DispatchState::Running);
        bridge.post_traffic(DatagramTraffic {
            rx_dgrams: 3,
            ..Default::default()
        });

        let posted = posted.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(
            posted[0],
            r#"{"info_type":"DispatchState","data":"Running"}"#
        );
        assert!(posted[1].starts_with(r#"{"info_type":"DatagramTraffic","data":{"#));
        assert!(posted[1].contains(r#""rx_dgrams":3"#));
    }

    #[test]
    fn test_bridge_without_listener_is_noop() {
        let bridge = TunnelInfoBridge::default();
        bridge.post_state(DispatchState::Closed);
    }
}
