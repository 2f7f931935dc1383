//! Round-robin channel pool for binary-RPC endpoints.
//!
//! One fixed-size ring of channels per endpoint. Channels connect lazily
//! and keep themselves alive with HTTP/2 keepalive pings, so the pool
//! carries no per-call state: `get` hands out the next channel under a
//! read lock, structural changes take the write lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::EngineError;

pub const DEFAULT_POOL_SIZE: usize = 5;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChannelPool {
    endpoint: String,
    channels: RwLock<Vec<Channel>>,
    cursor: AtomicUsize,
}

impl ChannelPool {
    /// Build a pool of `size` channels for `endpoint` (0 means default).
    pub fn connect(endpoint: &str, size: usize) -> Result<Self, EngineError> {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let mut channels = Vec::with_capacity(size);
        for _ in 0..size {
            channels.push(open_channel(endpoint)?);
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            channels: RwLock::new(channels),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next channel, round-robin. `None` once the pool has been closed.
    pub fn get(&self) -> Option<Channel> {
        let channels = self.channels.read().expect("pool lock poisoned");
        if channels.is_empty() {
            return None;
        }
        let next = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(channels[next % channels.len()].clone())
    }

    /// Replace the channel at `index` with a freshly opened one.
    pub fn refresh(&self, index: usize) -> Result<(), EngineError> {
        let mut channels = self.channels.write().expect("pool lock poisoned");
        if index >= channels.len() {
            return Err(EngineError::Internal(format!(
                "invalid connection index {index} for pool of {}",
                channels.len()
            )));
        }
        channels[index] = open_channel(&self.endpoint)?;
        Ok(())
    }

    /// Drop every channel. Subsequent `get` calls return `None`.
    pub fn close(&self) {
        self.channels.write().expect("pool lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.channels.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("endpoint", &self.endpoint)
            .field("size", &self.len())
            .finish()
    }
}

fn open_channel(endpoint: &str) -> Result<Channel, EngineError> {
    let uri = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|err| EngineError::Connect(err.to_string()))?
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .connect_timeout(CONNECT_TIMEOUT);
    Ok(endpoint.connect_lazy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_the_requested_ring_size() {
        let pool = ChannelPool::connect("localhost:50051", 3).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.endpoint(), "localhost:50051");
    }

    #[tokio::test]
    async fn zero_size_falls_back_to_default() {
        let pool = ChannelPool::connect("localhost:50051", 0).unwrap();
        assert_eq!(pool.len(), DEFAULT_POOL_SIZE);
    }

    #[tokio::test]
    async fn get_cycles_through_the_ring() {
        let pool = ChannelPool::connect("localhost:50051", 2).unwrap();
        for _ in 0..6 {
            assert!(pool.get().is_some());
        }
        assert_eq!(pool.cursor.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn refresh_rejects_out_of_range_indices() {
        let pool = ChannelPool::connect("localhost:50051", 2).unwrap();
        assert!(pool.refresh(1).is_ok());
        assert!(pool.refresh(2).is_err());
    }

    #[tokio::test]
    async fn close_empties_the_pool() {
        let pool = ChannelPool::connect("localhost:50051", 2).unwrap();
        pool.close();
        assert!(pool.is_empty());
        assert!(pool.get().is_none());
    }

    #[test]
    fn rejects_invalid_endpoints() {
        assert!(ChannelPool::connect("not a uri", 1).is_err());
    }
}
