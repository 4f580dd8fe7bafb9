//! Weighted round-robin dispatch table
//!
//! This is the dispatch table the gateway binary puts behind the request
//! router. It starts out with whatever servers service discovery seeded and is
//! rewritten by the router on every request.

use crate::dispatch::{Destination, Dispatch, ProxyBody, Server};
use crate::error::{json_error_response, DispatchError, ProxyErrorCode};
use crate::pool::ConnectionPool;
use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Load balancer over a weighted server list
pub struct Balancer {
    name: String,
    servers: RwLock<Vec<Server>>,
    next_index: AtomicUsize,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    /// Max wait for the write lock before an update is abandoned
    lock_timeout: Duration,
}

impl Balancer {
    pub fn new(name: impl Into<String>, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            servers: RwLock::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            pool,
            request_timeout,
            lock_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Seed the table, e.g. with placeholders from service discovery
    pub fn with_servers(self, servers: Vec<Server>) -> Self {
        *self.servers.write() = servers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick the next destination, honoring weights. Zero-weight servers are skipped.
    pub fn next_destination(&self) -> Option<Destination> {
        let servers = self.servers.read();
        let total: usize = servers.iter().map(|s| s.weight as usize).sum();
        if total == 0 {
            return None;
        }

        let mut slot = self.next_index.fetch_add(1, Ordering::Relaxed) % total;
        for server in servers.iter() {
            let weight = server.weight as usize;
            if slot < weight {
                return Some(server.destination.clone());
            }
            slot -= weight;
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn read_table(&self) -> parking_lot::RwLockReadGuard<'_, Vec<Server>> {
        self.servers.read()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Server>>, DispatchError> {
        self.servers.try_write_for(self.lock_timeout).ok_or_else(|| {
            DispatchError::UpdateFailed(format!(
                "timed out after {}ms waiting for the dispatch table lock",
                self.lock_timeout.as_millis()
            ))
        })
    }
}

impl Dispatch for Balancer {
    fn servers(&self) -> Vec<Server> {
        self.servers.read().clone()
    }

    fn remove_server(&self, destination: &Destination) -> Result<(), DispatchError> {
        let mut servers = self.write()?;
        servers.retain(|s| &s.destination != destination);
        Ok(())
    }

    fn upsert_server(&self, destination: Destination, weight: u32) -> Result<(), DispatchError> {
        let mut servers = self.write()?;
        match servers.iter_mut().find(|s| s.destination == destination) {
            Some(server) => server.weight = weight,
            None => servers.push(Server::new(destination, weight)),
        }
        Ok(())
    }

    fn replace_servers(&self, destination: Destination, weight: u32) -> Result<(), DispatchError> {
        let mut servers = self.write()?;

        if servers.len() == 1 && servers[0].destination == destination && servers[0].weight == weight {
            return Ok(());
        }

        let replaced = servers.len();
        servers.clear();
        servers.push(Server::new(destination.clone(), weight));
        drop(servers);

        info!(
            balancer = self.name,
            destination = %destination,
            replaced,
            "Dispatch table now points at webspace"
        );
        Ok(())
    }

    async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(destination) = self.next_destination() else {
            warn!(balancer = self.name, "No servers in dispatch table");
            return json_error_response(ProxyErrorCode::NoServers, "No servers available");
        };

        debug!(balancer = self.name, destination = %destination, method = %req.method(), uri = %req.uri(), "Forwarding request");

        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req, &destination)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(balancer = self.name, destination = %destination, error = %e, "Failed to forward request via pool");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    balancer = self.name,
                    destination = %destination,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }
}
