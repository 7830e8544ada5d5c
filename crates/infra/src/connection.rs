//! Shared broker connection.
//!
//! One [`BrokerConnection`] per process: it owns the data-plane client used
//! for publishing and receiving, and the administration client used for rule
//! management. Both are opened from the same connection string.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::broker::{BrokerClient, BrokerConnector, BrokerError, RuleAdministration};

pub struct BrokerConnection {
    connection_string: String,
    connector: Arc<dyn BrokerConnector>,
    client: Mutex<Arc<dyn BrokerClient>>,
    administration: Arc<dyn RuleAdministration>,
    disposed: AtomicBool,
}

impl BrokerConnection {
    /// Open the data-plane and administration clients.
    pub fn open(
        connection_string: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, BrokerError> {
        let connection_string = connection_string.into();
        let client = connector.open_client(&connection_string)?;
        let administration = connector.open_administration(&connection_string)?;
        info!("broker connection opened");

        Ok(Self {
            connection_string,
            connector,
            client: Mutex::new(client),
            administration,
            disposed: AtomicBool::new(false),
        })
    }

    /// The current data-plane client, reopened if it was closed.
    pub fn topic_client(&self) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        if self.is_disposed() {
            return Err(BrokerError::Closed);
        }

        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if client.is_closed() {
            debug!("topic client closed, reconnecting");
            *client = self.connector.open_client(&self.connection_string)?;
        }
        Ok(client.clone())
    }

    /// Administration client; the same instance for the connection lifetime.
    pub fn administration(&self) -> Arc<dyn RuleAdministration> {
        self.administration.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Close the data-plane client. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        info!("broker connection disposed");
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, InMemoryConnector};

    fn connection() -> (InMemoryConnector, BrokerConnection) {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let conn = BrokerConnection::open("memory://local", Arc::new(connector.clone())).unwrap();
        (connector, conn)
    }

    #[test]
    fn closed_client_is_recreated() {
        let (connector, conn) = connection();
        let first = conn.topic_client().unwrap();
        first.close();

        let second = conn.topic_client().unwrap();
        assert!(!second.is_closed());
        assert_eq!(connector.clients_opened(), 2);
    }

    #[test]
    fn open_client_is_reused() {
        let (connector, conn) = connection();
        let a = conn.topic_client().unwrap();
        let b = conn.topic_client().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.clients_opened(), 1);
    }

    #[test]
    fn dispose_is_idempotent_and_closes_client() {
        let (_connector, conn) = connection();
        let client = conn.topic_client().unwrap();

        conn.dispose();
        conn.dispose();

        assert!(client.is_closed());
        assert!(conn.is_disposed());
        assert_eq!(conn.topic_client().err(), Some(BrokerError::Closed));
    }

    #[test]
    fn empty_connection_string_fails() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        assert!(BrokerConnection::open("", Arc::new(connector)).is_err());
    }
}
