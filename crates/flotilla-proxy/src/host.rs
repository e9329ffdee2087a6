//! Hostname parsing — the total function deciding which requests are ours.
//!
//! A routable host is exactly one label in front of the base domain, ending
//! in `-app` or `-agent`. Anything else — bare domain, multi-level
//! subdomains, infrastructure names, unknown suffixes — is not ours and the
//! request falls through. Matching is case-insensitive and port-stripping.

use serde::{Deserialize, Serialize};

/// Routing category encoded in the subdomain suffix, independent of which
/// backend serves the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Apps,
    Agents,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apps => "apps",
            Self::Agents => "agents",
        }
    }
}

/// Parsed routing key: (tier, slug).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub tier: Tier,
    pub slug: String,
}

/// Parse an inbound `Host` value into a routing key.
///
/// Returns `None` when the host is not a routable subdomain of
/// `base_domain`; the request is not ours in that case.
pub fn parse_host(host: &str, base_domain: &str) -> Option<RouteKey> {
    let host = host.trim().to_ascii_lowercase();
    let base = base_domain.trim().trim_end_matches('.').to_ascii_lowercase();

    // Strip a trailing :port, but only when what follows the colon is all
    // digits (hostnames never contain colons otherwise).
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host.as_str(),
    };

    // The host must be `{label}.{base}` — a single label, nothing deeper.
    let label = host.strip_suffix(&base)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }

    let (slug, tier) = if let Some(slug) = label.strip_suffix("-app") {
        (slug, Tier::Apps)
    } else if let Some(slug) = label.strip_suffix("-agent") {
        (slug, Tier::Agents)
    } else {
        return None;
    };

    if slug.is_empty() {
        return None;
    }
    Some(RouteKey {
        tier,
        slug: slug.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(host: &str) -> Option<RouteKey> {
        parse_host(host, "example.com")
    }

    #[test]
    fn app_suffix_maps_to_apps_tier() {
        let key = parse("svc-app.example.com").unwrap();
        assert_eq!(key.tier, Tier::Apps);
        assert_eq!(key.slug, "svc");
    }

    #[test]
    fn agent_suffix_maps_to_agents_tier() {
        let key = parse("svc-agent.example.com").unwrap();
        assert_eq!(key.tier, Tier::Agents);
        assert_eq!(key.slug, "svc");
    }

    #[test]
    fn bare_domain_is_not_ours() {
        assert!(parse("example.com").is_none());
    }

    #[test]
    fn suffixless_subdomain_is_not_ours() {
        assert!(parse("api.example.com").is_none());
    }

    #[test]
    fn multi_level_subdomain_is_not_ours() {
        assert!(parse("deep.nested-app.example.com").is_none());
    }

    #[test]
    fn case_insensitive_and_port_stripping() {
        let key = parse("SVC-APP.Example.com:443").unwrap();
        assert_eq!(key.tier, Tier::Apps);
        assert_eq!(key.slug, "svc");
    }

    #[test]
    fn empty_slug_is_not_ours() {
        assert!(parse("-app.example.com").is_none());
        assert!(parse("-agent.example.com").is_none());
    }

    #[test]
    fn unrelated_domain_is_not_ours() {
        assert!(parse("svc-app.other.com").is_none());
        // Suffix match must respect label boundaries.
        assert!(parse("svc-appexample.com").is_none());
    }

    #[test]
    fn slug_containing_dashes_survives() {
        let key = parse("my-cool-svc-app.example.com").unwrap();
        assert_eq!(key.slug, "my-cool-svc");
    }

    #[test]
    fn non_numeric_port_suffix_is_not_a_port() {
        // A colon followed by non-digits cannot be a port; the host as a
        // whole then fails the base-domain check.
        assert!(parse("svc-app.example.com:abc").is_none());
    }
}
