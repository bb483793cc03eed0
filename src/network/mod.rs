//! Network interception: the transport seam, response snapshots, and the
//! strategy router.

pub mod cache;
pub mod client;
pub mod router;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{canonical_key, ResponseCache, DYNAMIC_PARTITION, STATIC_PARTITION, TILES_PARTITION};
pub use client::{HttpTransport, Transport};
pub use router::{offline_response, ResourceClass, RouteRules, Router, OFFLINE_BODY, OFFLINE_STATUS};
pub use types::{CachedResponse, Request, RequestMode, Response, Served, ServedFrom};
