//! Connected-client registry (C6): tracks each client's subscribed symbol
//! set and fans out upstream frames with per-client filtering.

use axum::extract::ws::Message;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

const CLIENT_QUEUE_CAPACITY: usize = 1000;

struct ClientHandle {
    symbols: RwLock<HashSet<String>>,
    tx: mpsc::Sender<Message>,
}

pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
    union_tx: watch::Sender<HashSet<String>>,
}

impl ClientRegistry {
    pub fn new() -> (Arc<Self>, watch::Receiver<HashSet<String>>) {
        let (union_tx, union_rx) = watch::channel(HashSet::new());
        let registry = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            union_tx,
        });
        (registry, union_rx)
    }

    /// Registers a new client, returning its id and outbound mailbox.
    pub fn register(&self, symbols: HashSet<String>) -> (u64, mpsc::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.write().insert(
            id,
            ClientHandle {
                symbols: RwLock::new(symbols),
                tx,
            },
        );
        self.recompute_union();
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.write().remove(&id);
        self.recompute_union();
    }

    pub fn subscribe(&self, id: u64, symbols: impl IntoIterator<Item = String>) {
        if let Some(client) = self.clients.read().get(&id) {
            client.symbols.write().extend(symbols.into_iter().map(|s| s.to_uppercase()));
        }
        self.recompute_union();
    }

    pub fn unsubscribe(&self, id: u64, symbols: impl IntoIterator<Item = String>) {
        if let Some(client) = self.clients.read().get(&id) {
            let mut set = client.symbols.write();
            for s in symbols {
                set.remove(&s.to_uppercase());
            }
        }
        self.recompute_union();
    }

    pub fn symbols_of(&self, id: u64) -> HashSet<String> {
        self.clients
            .read()
            .get(&id)
            .map(|c| c.symbols.read().clone())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn recompute_union(&self) {
        let union: HashSet<String> = self
            .clients
            .read()
            .values()
            .flat_map(|c| c.symbols.read().clone())
            .collect();
        debug!(symbol_count = union.len(), "recomputed subscription union");
        let _ = self.union_tx.send(union);
    }

    /// Forwards one upstream frame to every client subscribed to `symbol`
    /// (or every client, if `symbol` could not be determined). Best effort:
    /// a client whose mailbox is full is dropped rather than blocked on.
    pub fn broadcast(&self, symbol: Option<&str>, raw: String) {
        let mut dead = Vec::new();
        for (&id, client) in self.clients.read().iter() {
            let interested = match symbol {
                Some(s) => client.symbols.read().contains(s),
                None => true,
            };
            if !interested {
                continue;
            }
            if client.tx.try_send(Message::Text(raw.clone())).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.write();
            for id in dead {
                clients.remove(&id);
            }
            drop(clients);
            self.recompute_union();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_updates_union() {
        let (registry, mut union_rx) = ClientRegistry::new();
        let (id, _rx) = registry.register(HashSet::from(["BTCUSDT".to_string()]));
        union_rx.changed().await.unwrap();
        assert!(union_rx.borrow().contains("BTCUSDT"));

        registry.subscribe(id, vec!["ethusdt".to_string()]);
        union_rx.changed().await.unwrap();
        assert!(union_rx.borrow().contains("ETHUSDT"));
    }

    #[tokio::test]
    async fn unregister_shrinks_union() {
        let (registry, mut union_rx) = ClientRegistry::new();
        let (id, _rx) = registry.register(HashSet::from(["BTCUSDT".to_string()]));
        union_rx.changed().await.unwrap();

        registry.unregister(id);
        union_rx.changed().await.unwrap();
        assert!(union_rx.borrow().is_empty());
    }

    #[tokio::test]
    async fn broadcast_filters_by_symbol() {
        let (registry, _rx) = ClientRegistry::new();
        let (_id_a, mut rx_a) = registry.register(HashSet::from(["BTCUSDT".to_string()]));
        let (_id_b, mut rx_b) = registry.register(HashSet::from(["ETHUSDT".to_string()]));

        registry.broadcast(Some("BTCUSDT"), "payload".to_string());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
