//! Registry of live server connections keyed by local connection id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::connection::ServerConnection;
use super::state_machine::ServerState;
use super::ServerContext;
use crate::quic::connection::PacketSender;
use crate::quic::connection_id::ConnectionId;
use crate::quic::error::Result;
use crate::quic::stream::StreamListener;
use crate::quic::version::Version;

pub struct Connections {
    connections: DashMap<ConnectionId, ServerConnection>,
    context: Arc<ServerContext>,
}

impl Connections {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            connections: DashMap::new(),
            context,
        }
    }

    /// Return the connection for `cid`, creating it if absent. Racing
    /// callers for the same id all get the same connection. A missing id
    /// gets a fresh random one.
    pub fn get_or_create(
        &self,
        cid: Option<ConnectionId>,
        listener: Arc<dyn StreamListener>,
        sender: Arc<dyn PacketSender>,
    ) -> Result<ServerConnection> {
        let cid = cid.unwrap_or_else(ConnectionId::random);
        match self.connections.entry(cid.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let connection =
                    ServerConnection::new(cid.clone(), Version::CURRENT, &self.context, listener, sender)?;
                entry.insert(connection.clone());
                info!("New server connection {}", cid);
                Ok(connection)
            }
        }
    }

    pub fn get(&self, cid: &ConnectionId) -> Option<ServerConnection> {
        self.connections.get(cid).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, cid: &ConnectionId) -> Option<ServerConnection> {
        self.connections.remove(cid).map(|(_, connection)| connection)
    }

    /// Forget connections that reached Closed.
    pub fn prune_closed(&self) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, connection| connection.state() != ServerState::Closed);
        before - self.connections.len()
    }

    pub async fn close_all(&self) {
        let connections: Vec<ServerConnection> =
            self.connections.iter().map(|entry| entry.value().clone()).collect();
        let results = join_all(connections.iter().map(|c| c.close())).await;
        for (connection, result) in connections.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to close {}: {}", connection.local_connection_id(), e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("len", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::connection::test_support::RecordingSender;
    use crate::quic::stream::NoopStreamListener;
    use crate::server::tests::test_context;

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let connections = Connections::new(Arc::new(test_context()));
        let sender = Arc::new(RecordingSender::default());
        let cid = ConnectionId::random();

        let first = connections
            .get_or_create(Some(cid.clone()), Arc::new(NoopStreamListener), sender.clone())
            .unwrap();
        let second = connections
            .get_or_create(Some(cid.clone()), Arc::new(NoopStreamListener), sender.clone())
            .unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(first.local_connection_id(), second.local_connection_id());
        assert!(connections.get(&cid).is_some());
        assert!(connections.get(&ConnectionId::random()).is_none());

        let generated = connections
            .get_or_create(None, Arc::new(NoopStreamListener), sender)
            .unwrap();
        assert_eq!(generated.local_connection_id().len(), 8);
        assert_eq!(connections.len(), 2);
    }

    #[tokio::test]
    async fn test_close_all_and_prune() {
        let connections = Connections::new(Arc::new(test_context()));
        let sender = Arc::new(RecordingSender::default());
        for _ in 0..3 {
            connections
                .get_or_create(None, Arc::new(NoopStreamListener), sender.clone())
                .unwrap();
        }
        connections.close_all().await;
        assert_eq!(connections.prune_closed(), 3);
        assert!(connections.is_empty());
        assert!(*sender.destroyed.lock());
    }
}
