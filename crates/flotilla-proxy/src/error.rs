//! Routing error shapes.
//!
//! Four distinct failures, each with its own HTTP status and
//! machine-readable code so clients and dashboards can tell "wrong slug"
//! from "deploy still settling".

use thiserror::Error;

/// Why a hostname could not be routed.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("unknown service slug: {0}")]
    UnknownSlug(String),

    #[error("service {0} has no active deployment")]
    NoActiveDeployment(String),

    #[error("deployment for {0} has not exposed a reachable URI yet")]
    NotReady(String),

    #[error("route lookup failed: {0}")]
    Store(String),
}

impl RouteError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownSlug(_) => 404,
            Self::NoActiveDeployment(_) => 503,
            Self::NotReady(_) => 503,
            Self::Store(_) => 502,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSlug(_) => "unknown_service",
            Self::NoActiveDeployment(_) => "no_active_deployment",
            Self::NotReady(_) => "deployment_not_ready",
            Self::Store(_) => "lookup_failed",
        }
    }

    /// Seconds to suggest in `Retry-After`, when retrying makes sense.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::NotReady(_) => Some(10),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_failure_shape_is_distinct() {
        let cases = [
            (RouteError::UnknownSlug("x".into()), 404, "unknown_service"),
            (
                RouteError::NoActiveDeployment("x".into()),
                503,
                "no_active_deployment",
            ),
            (RouteError::NotReady("x".into()), 503, "deployment_not_ready"),
            (RouteError::Store("x".into()), 502, "lookup_failed"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.http_status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn only_not_ready_suggests_retry() {
        assert_eq!(RouteError::NotReady("x".into()).retry_after_secs(), Some(10));
        assert_eq!(RouteError::UnknownSlug("x".into()).retry_after_secs(), None);
    }
}
