//! Service registry: immutable configuration, channel pools, breakers
//! and health flags, keyed by service name.
//!
//! Registrations happen once at load time under the write lock; every
//! lookup during execution takes the read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tonic::transport::Channel;
use tracing::{debug, info};

use crate::breaker::{BreakerSettings, BreakerState, CircuitBreaker};
use crate::error::EngineError;
use crate::pool::{ChannelPool, DEFAULT_POOL_SIZE};
use crate::workflow::{Service, ServiceKind};

pub struct ServiceEntry {
    pub name: String,
    pub config: Service,
    /// Present only for binary-RPC services.
    pub pool: Option<ChannelPool>,
    pub breaker: CircuitBreaker,
    healthy: Arc<AtomicBool>,
}

impl ServiceEntry {
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    pool_size: usize,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            pool_size,
        }
    }

    pub fn register(&self, name: &str, config: Service) -> Result<(), EngineError> {
        let mut services = self.services.write().expect("registry lock poisoned");
        if services.contains_key(name) {
            return Err(EngineError::ServiceExists(name.to_string()));
        }

        let pool = match config.kind {
            ServiceKind::Grpc => Some(ChannelPool::connect(&config.endpoint, self.pool_size)?),
            ServiceKind::Http => None,
        };

        let healthy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&healthy);
        let breaker = CircuitBreaker::with_listener(
            format!("{name}_circuit_breaker"),
            BreakerSettings::default(),
            move |_, to| match to {
                BreakerState::Open => flag.store(false, Ordering::SeqCst),
                BreakerState::Closed => flag.store(true, Ordering::SeqCst),
                BreakerState::HalfOpen => {}
            },
        );

        info!(
            service = name,
            kind = config.kind.as_str(),
            endpoint = %config.endpoint,
            "service registered"
        );
        services.insert(
            name.to_string(),
            Arc::new(ServiceEntry {
                name: name.to_string(),
                config,
                pool,
                breaker,
                healthy,
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServiceEntry>, EngineError> {
        self.services
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ServiceNotFound(name.to_string()))
    }

    /// Round-robin channel for a binary-RPC service.
    pub fn channel(&self, name: &str) -> Result<Channel, EngineError> {
        let entry = self.get(name)?;
        entry
            .pool
            .as_ref()
            .and_then(|pool| pool.get())
            .ok_or_else(|| {
                EngineError::Connect(format!("no open connections for service {name}"))
            })
    }

    pub fn set_health(&self, name: &str, healthy: bool) {
        if let Ok(entry) = self.get(name) {
            debug!(service = name, healthy, "service health updated");
            entry.set_healthy(healthy);
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.get(name).map(|entry| entry.healthy()).unwrap_or(false)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Drop every pooled connection.
    pub fn close(&self) {
        let services = self.services.read().expect("registry lock poisoned");
        for entry in services.values() {
            if let Some(pool) = &entry.pool {
                pool.close();
            }
        }
    }
}
