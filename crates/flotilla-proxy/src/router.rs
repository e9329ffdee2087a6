//! The subdomain router — cache-or-resolve, then forward.
//!
//! `handle` owns the full request path: decline hosts that are not ours,
//! resolve the routing key through the cache, and forward the request (or
//! WebSocket upgrade) to the backend that currently serves the slug.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::cache::RouteCache;
use crate::error::RouteError;
use crate::host::{RouteKey, Tier, parse_host};
use crate::resolver::{ResolvedRoute, RouteResolver};

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public base domain the routable subdomains hang off.
    pub base_domain: String,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl ProxyConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 1024,
        }
    }
}

/// Headers that must not be forwarded hop to hop.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::PROXY_AUTHENTICATE
        || *name == header::PROXY_AUTHORIZATION
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::TRANSFER_ENCODING
        || name.as_str() == "keep-alive"
}

/// Routes inbound requests to the active backend for their subdomain.
pub struct SubdomainRouter {
    config: ProxyConfig,
    cache: RouteCache,
    resolver: Arc<dyn RouteResolver>,
    client: Client<HttpConnector, ProxyBody>,
}

impl SubdomainRouter {
    pub fn new(config: ProxyConfig, resolver: Arc<dyn RouteResolver>) -> Self {
        let cache = RouteCache::new(config.cache_ttl, config.cache_capacity);
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            config,
            cache,
            resolver,
            client,
        }
    }

    /// Routing key for a request host, when the host is ours.
    pub fn route_key_for(&self, host: &str) -> Option<RouteKey> {
        parse_host(host, &self.config.base_domain)
    }

    /// Cache-or-resolve a routing key.
    ///
    /// Steady state is a cache hit; a miss queries the resolver once and
    /// caches the winning URL with its observed native status.
    pub async fn lookup(&self, key: &RouteKey) -> Result<ResolvedRoute, RouteError> {
        if let Some(entry) = self.cache.get(key) {
            return Ok(ResolvedRoute {
                target_url: entry.target_url,
                native_status: entry.native_status,
            });
        }
        let route = self.resolver.resolve(&key.slug).await?;
        self.cache.insert(
            key.clone(),
            route.target_url.clone(),
            route.native_status.clone(),
        );
        Ok(route)
    }

    /// Force the next lookup for a slug to hit the datastore.
    pub fn invalidate_slug(&self, slug: &str, tier: Option<Tier>) {
        self.cache.invalidate(slug, tier);
    }

    /// Drop every cached route.
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    /// Handle one inbound request.
    ///
    /// `None` means the host is not ours and the caller should fall through
    /// to other handling. `Some` is always a complete response; routing
    /// failures become JSON error responses, never escaped errors.
    pub async fn handle(&self, req: Request<Incoming>) -> Option<Response<ProxyBody>> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

        let key = self.route_key_for(&host)?;

        let route = match self.lookup(&key).await {
            Ok(route) => route,
            Err(err) => return Some(error_response(&err)),
        };

        debug!(
            slug = %key.slug,
            tier = key.tier.as_str(),
            target = %route.target_url,
            "proxying request"
        );

        if is_upgrade(&req) {
            Some(self.forward_upgrade(req, &key, &host, &route).await)
        } else {
            Some(self.forward_request(req, &key, &host, &route).await)
        }
    }

    /// Plain request forwarding.
    async fn forward_request(
        &self,
        req: Request<Incoming>,
        key: &RouteKey,
        original_host: &str,
        route: &ResolvedRoute,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let uri = match target_uri(&route.target_url, &parts.uri) {
            Ok(uri) => uri,
            Err(message) => return bad_gateway(&message),
        };

        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &parts.headers {
                if *name == header::HOST || is_hop_by_hop(name) || *name == header::UPGRADE {
                    continue;
                }
                headers.append(name, value.clone());
            }
            set_forwarding_headers(headers, key, original_host);
        }

        let outbound = match builder.body(BoxBody::new(body)) {
            Ok(outbound) => outbound,
            Err(e) => return bad_gateway(&e.to_string()),
        };

        match self.client.request(outbound).await {
            Ok(response) => response.map(BoxBody::new),
            Err(e) => {
                warn!(target = %route.target_url, error = %e, "upstream request failed");
                bad_gateway("upstream unreachable")
            }
        }
    }

    /// WebSocket upgrade forwarding: relay the handshake, then tunnel bytes
    /// both ways between the two upgraded connections.
    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        key: &RouteKey,
        original_host: &str,
        route: &ResolvedRoute,
    ) -> Response<ProxyBody> {
        let uri = match target_uri(&route.target_url, req.uri()) {
            Ok(uri) => uri,
            Err(message) => return bad_gateway(&message),
        };

        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut builder = Request::builder().method(req.method().clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in req.headers() {
                if *name == header::HOST {
                    continue;
                }
                // Upgrade handshakes keep their connection headers.
                headers.append(name, value.clone());
            }
            set_forwarding_headers(headers, key, original_host);
        }

        let outbound = match builder.body(empty_body()) {
            Ok(outbound) => outbound,
            Err(e) => return bad_gateway(&e.to_string()),
        };

        let mut response = match self.client.request(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!(target = %route.target_url, error = %e, "upstream upgrade failed");
                return bad_gateway("upstream unreachable");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let server_upgrade = hyper::upgrade::on(&mut response);
            let slug = key.slug.clone();
            tokio::spawn(async move {
                match (client_upgrade.await, server_upgrade.await) {
                    (Ok(client_io), Ok(server_io)) => {
                        let mut client_io = TokioIo::new(client_io);
                        let mut server_io = TokioIo::new(server_io);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await
                        {
                            debug!(slug = %slug, error = %e, "websocket tunnel closed");
                        }
                    }
                    (client, server) => {
                        warn!(
                            slug = %slug,
                            client_ok = client.is_ok(),
                            server_ok = server.is_ok(),
                            "websocket upgrade handshake failed"
                        );
                    }
                }
            });
        }

        response.map(BoxBody::new)
    }
}

/// Whether a request asks for a protocol upgrade.
fn is_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Rebuild the request URI against the resolved target.
fn target_uri(target_url: &str, original: &hyper::Uri) -> Result<hyper::Uri, String> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", target_url.trim_end_matches('/'), path_and_query)
        .parse()
        .map_err(|e| format!("bad target uri: {e}"))
}

/// Standard forwarding headers plus tier/slug markers for downstream
/// observability.
fn set_forwarding_headers(headers: &mut hyper::HeaderMap, key: &RouteKey, original_host: &str) {
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    headers.insert(
        HeaderName::from_static("x-flotilla-tier"),
        HeaderValue::from_static(match key.tier {
            Tier::Apps => "apps",
            Tier::Agents => "agents",
        }),
    );
    if let Ok(value) = HeaderValue::from_str(&key.slug) {
        headers.insert(HeaderName::from_static("x-flotilla-slug"), value);
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// JSON error response for a routing failure.
pub fn error_response(err: &RouteError) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    let mut builder = Response::builder()
        .status(err.http_status())
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(secs) = err.retry_after_secs() {
        builder = builder.header(header::RETRY_AFTER, secs);
    }
    builder
        .body(full_body(Bytes::from(body.to_string())))
        .expect("static response")
}

fn bad_gateway(message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "error": "upstream_unreachable",
        "message": message,
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body.to_string())))
        .expect("static response")
}
