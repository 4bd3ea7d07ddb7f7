//! Chunkserver connections and the short-TTL connection pool.
//!
//! Connections are expensive to set up and chunk reads are bursty, so a
//! finished request puts its connection back into the pool for a few
//! seconds. Expired connections are dropped on acquire and by `cleanup`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::NetworkAddress;

use super::messages::{CsReply, CsRequest};

/// One established channel to a chunkserver. Implementations frame and
/// ship the typed messages.
pub trait CsChannel: Send {
    fn send<'a>(
        &'a mut self,
        request: CsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn receive<'a>(&'a mut self)
        -> Pin<Box<dyn Future<Output = Result<CsReply>> + Send + 'a>>;
}

/// Dials chunkservers.
pub trait CsConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        address: NetworkAddress,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CsChannel>>> + Send + 'a>>;
}

struct PooledConnection {
    channel: Box<dyn CsChannel>,
    valid_until: Instant,
}

/// Keeps idle connections per endpoint for reuse within a short window.
pub struct ConnectionPool {
    connector: Arc<dyn CsConnector>,
    ttl: Duration,
    idle: Mutex<HashMap<NetworkAddress, Vec<PooledConnection>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn CsConnector>, ttl: Duration) -> Self {
        Self { connector, ttl, idle: Mutex::new(HashMap::new()) }
    }

    /// Take a pooled connection or dial a fresh one.
    pub async fn acquire(
        &self,
        address: NetworkAddress,
        connect_timeout: Duration,
    ) -> Result<Box<dyn CsChannel>> {
        let now = Instant::now();
        let pooled = {
            let mut idle = self.idle.lock();
            match idle.get_mut(&address) {
                Some(connections) => loop {
                    match connections.pop() {
                        Some(connection) if connection.valid_until > now => {
                            break Some(connection.channel)
                        }
                        Some(_) => continue, // expired, drop it
                        None => break None,
                    }
                },
                None => None,
            }
        };
        if let Some(channel) = pooled {
            return Ok(channel);
        }
        debug!("dialing chunkserver {}", address);
        self.connector.connect(address, connect_timeout).await
    }

    /// Return a healthy connection for future use.
    pub fn release(&self, address: NetworkAddress, channel: Box<dyn CsChannel>) {
        let connection = PooledConnection { channel, valid_until: Instant::now() + self.ttl };
        self.idle.lock().entry(address).or_insert_with(Vec::new).push(connection);
    }

    /// Drop every expired idle connection.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        for connections in idle.values_mut() {
            connections.retain(|connection| connection.valid_until > now);
        }
        idle.retain(|_, connections| !connections.is_empty());
    }

    #[cfg(test)]
    fn idle_count(&self, address: NetworkAddress) -> usize {
        self.idle.lock().get(&address).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullChannel;

    impl CsChannel for NullChannel {
        fn send<'a>(
            &'a mut self,
            _request: CsRequest,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn receive<'a>(
            &'a mut self,
        ) -> Pin<Box<dyn Future<Output = Result<CsReply>> + Send + 'a>> {
            Box::pin(async { Err(crate::error::FsError::Timeout) })
        }
    }

    struct CountingConnector {
        dials: AtomicU32,
    }

    impl CsConnector for CountingConnector {
        fn connect<'a>(
            &'a self,
            _address: NetworkAddress,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CsChannel>>> + Send + 'a>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Box::new(NullChannel) as Box<dyn CsChannel>) })
        }
    }

    #[tokio::test]
    async fn pooled_connection_is_reused() {
        let connector = Arc::new(CountingConnector { dials: AtomicU32::new(0) });
        let pool = ConnectionPool::new(connector.clone(), Duration::from_secs(3));
        let address = NetworkAddress::new(1, 1);

        let channel = pool.acquire(address, Duration::from_secs(1)).await.unwrap();
        pool.release(address, channel);
        let _channel = pool.acquire(address, Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_connection_is_redialed() {
        let connector = Arc::new(CountingConnector { dials: AtomicU32::new(0) });
        let pool = ConnectionPool::new(connector.clone(), Duration::from_millis(0));
        let address = NetworkAddress::new(1, 1);

        let channel = pool.acquire(address, Duration::from_secs(1)).await.unwrap();
        pool.release(address, channel);
        let _channel = pool.acquire(address, Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(address), 0);
    }

    #[tokio::test]
    async fn cleanup_discards_expired() {
        let connector = Arc::new(CountingConnector { dials: AtomicU32::new(0) });
        let pool = ConnectionPool::new(connector.clone(), Duration::from_millis(0));
        let address = NetworkAddress::new(1, 1);
        let channel = pool.acquire(address, Duration::from_secs(1)).await.unwrap();
        pool.release(address, channel);
        assert_eq!(pool.idle_count(address), 1);
        pool.cleanup();
        assert_eq!(pool.idle_count(address), 0);
    }
}
