//! Webspace Gate - boots webspaces on demand and routes traffic to them
//!
//! This library provides a gate-then-route layer that:
//! - Asks a control plane to ensure a user's webspace is started
//! - Resolves the webspace's current `host:port` from its runtime config
//! - Points an HTTP dispatch table at that address before each request
//! - Relays raw TCP connections to that address
//! - Shares one in-flight boot between concurrent requests

pub mod balancer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod pool;
pub mod proxy;
pub mod stream;
pub mod webspace;
