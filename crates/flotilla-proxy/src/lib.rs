//! flotilla-proxy — the subdomain reverse proxy.
//!
//! Inbound hostnames of the form `{slug}-app.{base}` or `{slug}-agent.{base}`
//! resolve to whichever backend currently serves the slug's service: the
//! marketplace deployment's URI when one exists, the TEE deployment's URL
//! otherwise. Lookups go through a bounded TTL/LRU cache so steady-state
//! routing never touches the datastore.
//!
//! Requests the proxy does not own (bare domain, unknown suffix, multi-level
//! subdomains) are declined so the caller can fall through to other
//! handling. Routing failures always become an HTTP response with a
//! machine-readable code, never an escaped error.

pub mod cache;
pub mod error;
pub mod host;
pub mod resolver;
pub mod router;

pub use cache::{CacheEntry, RouteCache};
pub use error::RouteError;
pub use host::{RouteKey, Tier, parse_host};
pub use resolver::{ResolvedRoute, RouteResolver, StoreResolver};
pub use router::{ProxyBody, ProxyConfig, SubdomainRouter, error_response};
