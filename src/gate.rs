//! Per-identity boot gate
//!
//! Every inbound request or connection calls [`BootGate::resolve`] before it is
//! forwarded. Concurrent callers share one in-flight boot round trip instead of
//! each hitting the control plane, and a successful address may be reused for
//! a short, configurable time.

use crate::error::{BootError, ConfigError};
use crate::webspace::{Identity, LifecycleClient};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

type BootResult = Result<String, BootError>;
type BootFuture = Shared<BoxFuture<'static, BootResult>>;

/// Tuning for the boot round trip
#[derive(Debug, Clone)]
pub struct GateOptions {
    /// Timeout of each control-plane call
    pub request_timeout: Duration,
    /// Upper bound for the whole ensure-started + config sequence
    pub boot_timeout: Duration,
    /// How long a resolved address is reused; zero resolves on every call
    pub cache_ttl: Duration,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            boot_timeout: Duration::from_secs(60),
            cache_ttl: Duration::ZERO,
        }
    }
}

struct CachedAddr {
    addr: String,
    resolved_at: Instant,
}

#[derive(Default)]
struct FlightState {
    generation: u64,
    /// Weak so that the round trip is cancelled once every waiter is gone
    in_flight: Option<(u64, WeakShared<BoxFuture<'static, BootResult>>)>,
    cached: Option<CachedAddr>,
}

impl FlightState {
    fn fresh_addr(&self, ttl: Duration) -> Option<String> {
        self.cached
            .as_ref()
            .filter(|c| c.resolved_at.elapsed() < ttl)
            .map(|c| c.addr.clone())
    }

    /// The boot still in flight, if any. A flight that already finished is
    /// never joined, even before its waiters have cleared it.
    fn join(&self) -> Option<(u64, BootFuture)> {
        let (generation, weak) = self.in_flight.as_ref()?;
        weak.upgrade()
            .filter(|flight| flight.peek().is_none())
            .map(|flight| (*generation, flight))
    }
}

/// Boots and resolves the webspace of a single identity
pub struct BootGate {
    client: LifecycleClient,
    options: GateOptions,
    state: Mutex<FlightState>,
}

impl BootGate {
    /// Build a gate for `identity`. Fails before any network call if the
    /// identity has an empty URL, an empty token, or a zero user id.
    pub fn new(identity: Identity, options: GateOptions) -> Result<Self, ConfigError> {
        let client = LifecycleClient::new(identity, options.request_timeout)?;
        Ok(Self {
            client,
            options,
            state: Mutex::new(FlightState::default()),
        })
    }

    pub fn identity(&self) -> &Identity {
        self.client.identity()
    }

    pub fn options(&self) -> &GateOptions {
        &self.options
    }

    /// Ensure the webspace is running and return its current `host:port`
    pub async fn resolve(&self) -> BootResult {
        let user_id = self.identity().user_id;

        let (generation, flight) = {
            let mut state = self.state.lock();

            if let Some(addr) = state.fresh_addr(self.options.cache_ttl) {
                debug!(user_id, addr, "Using cached webspace address");
                return Ok(addr);
            }

            let joined = state.join();
            match joined {
                Some(joined) => {
                    debug!(user_id, "Joining in-flight webspace boot");
                    joined
                }
                None => {
                    debug!(user_id, "Waiting for webspace to be started");
                    state.generation += 1;
                    let generation = state.generation;
                    let flight = self.start_boot();
                    state.in_flight = flight.downgrade().map(|weak| (generation, weak));
                    (generation, flight)
                }
            }
        };

        let result = flight.await;

        let mut state = self.state.lock();
        if matches!(state.in_flight, Some((g, _)) if g == generation) {
            state.in_flight = None;
            if let Ok(addr) = &result {
                if !self.options.cache_ttl.is_zero() {
                    state.cached = Some(CachedAddr {
                        addr: addr.clone(),
                        resolved_at: Instant::now(),
                    });
                }
            }
        }

        result
    }

    /// Forget the cached address so the next call performs a full round trip
    pub fn invalidate(&self) {
        self.state.lock().cached = None;
    }

    fn start_boot(&self) -> BootFuture {
        let client = self.client.clone();
        let boot_timeout = self.options.boot_timeout;

        async move {
            match tokio::time::timeout(boot_timeout, client.boot()).await {
                Ok(result) => result,
                Err(_) => Err(BootError::Timeout("webspace boot")),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_rejects_incomplete_identity() {
        let options = GateOptions::default();
        assert!(BootGate::new(Identity::new("", "t", 1), options.clone()).is_err());
        assert!(BootGate::new(Identity::new("http://cp", "", 1), options.clone()).is_err());
        assert!(BootGate::new(Identity::new("http://cp", "t", 0), options.clone()).is_err());
        assert!(BootGate::new(Identity::new("http://cp", "t", 1), options).is_ok());
    }

    #[test]
    fn test_cache_respects_ttl() {
        let mut state = FlightState::default();
        assert_eq!(state.fresh_addr(Duration::from_secs(5)), None);

        state.cached = Some(CachedAddr {
            addr: "10.0.0.5:8080".to_string(),
            resolved_at: Instant::now(),
        });
        assert_eq!(
            state.fresh_addr(Duration::from_secs(5)).as_deref(),
            Some("10.0.0.5:8080")
        );
        assert_eq!(state.fresh_addr(Duration::ZERO), None);
    }

    #[tokio::test]
    async fn test_finished_flight_is_not_joined() {
        let finished: BootFuture = async { Err(BootError::Timeout("webspace boot")) }
            .boxed()
            .shared();
        assert!(finished.clone().await.is_err());

        let mut state = FlightState::default();
        state.in_flight = finished.downgrade().map(|weak| (1, weak));
        assert!(state.join().is_none());

        let pending: BootFuture = futures::future::pending().boxed().shared();
        state.in_flight = pending.downgrade().map(|weak| (2, weak));
        assert_eq!(state.join().map(|(generation, _)| generation), Some(2));
    }

    #[tokio::test]
    async fn test_failed_boot_is_not_cached() {
        let options = GateOptions {
            request_timeout: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(60),
        };
        let gate = BootGate::new(Identity::new("http://127.0.0.1:1", "t", 1), options).unwrap();

        assert!(gate.resolve().await.is_err());
        let state = gate.state.lock();
        assert!(state.cached.is_none());
        assert!(state.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_boot_timeout() {
        // Accept connections but never answer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let options = GateOptions {
            request_timeout: Duration::ZERO,
            boot_timeout: Duration::from_millis(200),
            cache_ttl: Duration::ZERO,
        };
        let gate = BootGate::new(Identity::new(format!("http://{}", addr), "t", 1), options).unwrap();

        assert_eq!(gate.resolve().await, Err(BootError::Timeout("webspace boot")));
    }

    #[tokio::test]
    async fn test_control_plane_call_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let options = GateOptions {
            request_timeout: Duration::from_millis(100),
            boot_timeout: Duration::from_secs(5),
            cache_ttl: Duration::ZERO,
        };
        let gate = BootGate::new(Identity::new(format!("http://{}", addr), "t", 1), options).unwrap();

        assert_eq!(gate.resolve().await, Err(BootError::Timeout("ensure-started")));
    }
}
