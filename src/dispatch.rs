//! Dispatch table capability exposed by the routing host
//!
//! The request router never inspects the handler chain it sits in. The host
//! hands it an `Arc<impl Dispatch>` at construction, and the router uses only
//! this interface to rewrite where requests go.

use crate::error::DispatchError;
use http::uri::Authority;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use std::fmt;
use std::future::Future;

/// Response body type used on the data path
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Weight given to the single webspace entry
pub const DEFAULT_WEIGHT: u32 = 1;

/// An `http://host:port` backend reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    authority: Authority,
}

impl Destination {
    /// Build a destination from a resolved `host:port`
    pub fn from_addr(addr: &str) -> Result<Self, DispatchError> {
        Self::parse_url(&format!("http://{}", addr))
    }

    /// Parse an `http://host[:port]` URL. Paths and queries are rejected.
    pub fn parse_url(url: &str) -> Result<Self, DispatchError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| DispatchError::AddressUnparsable(format!("{}: {}", url, e)))?;

        if uri.scheme_str() != Some("http") {
            return Err(DispatchError::AddressUnparsable(format!(
                "{}: scheme must be http",
                url
            )));
        }

        let authority = uri
            .authority()
            .filter(|a| !a.host().is_empty())
            .cloned()
            .ok_or_else(|| DispatchError::AddressUnparsable(format!("{}: missing host", url)))?;

        let has_path = !matches!(uri.path(), "" | "/");
        if has_path || uri.query().is_some() {
            return Err(DispatchError::AddressUnparsable(format!(
                "{}: unexpected path or query",
                url
            )));
        }

        Ok(Self { authority })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute URI for a request path on this destination
    pub fn uri_for(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.authority, path_and_query)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// A weighted entry in a dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub destination: Destination,
    pub weight: u32,
}

impl Server {
    pub fn new(destination: Destination, weight: u32) -> Self {
        Self {
            destination,
            weight,
        }
    }
}

/// A routable set of servers plus the ability to forward a request to it
pub trait Dispatch: Send + Sync + 'static {
    /// Snapshot of the current entries
    fn servers(&self) -> Vec<Server>;

    fn remove_server(&self, destination: &Destination) -> Result<(), DispatchError>;

    /// Insert `destination`, or update its weight if already present
    fn upsert_server(&self, destination: Destination, weight: u32) -> Result<(), DispatchError>;

    /// Remove every entry and insert `destination` as the only one, under a
    /// single lock acquisition. On error the table is left untouched.
    fn replace_servers(&self, destination: Destination, weight: u32) -> Result<(), DispatchError>;

    /// Forward a request to one of the current entries
    fn serve(&self, req: Request<Incoming>) -> impl Future<Output = Response<ProxyBody>> + Send;
}
