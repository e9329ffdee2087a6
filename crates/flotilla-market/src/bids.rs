//! Bid selection — deterministic safety filtering and price ordering.
//!
//! A pure function over the observed bids: no I/O, no randomness, identical
//! inputs always produce identical output so the deploy state machine stays
//! testable.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use flotilla_provider::DeployShape;

/// A single bid as observed on chain. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub provider: String,
    pub gseq: u32,
    pub oseq: u32,
    /// Price amount as reported by the chain (string; may not parse).
    pub price_amount: String,
    pub price_denom: String,
}

/// Provider deny policy, parameterized by deployment shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenyPolicy {
    /// Providers excluded for every deployment.
    #[serde(default)]
    pub blocked: BTreeSet<String>,
    /// Providers additionally excluded when the deployment is directly
    /// exposed. A standalone deployment, reached only through the proxy,
    /// tolerates these.
    #[serde(default)]
    pub exposed_blocked: BTreeSet<String>,
}

impl DenyPolicy {
    /// Reason a provider is rejected under this policy, if any.
    fn rejection(&self, provider: &str, shape: DeployShape) -> Option<String> {
        if self.blocked.contains(provider) {
            return Some(format!("provider {provider} is on the block list"));
        }
        if shape == DeployShape::Exposed && self.exposed_blocked.contains(provider) {
            return Some(format!(
                "provider {provider} is not allowed for directly exposed deployments"
            ));
        }
        None
    }
}

/// A bid annotated with its parsed price and safety verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBid {
    pub bid: Bid,
    /// Parsed price; `None` when the amount failed to parse.
    pub price: Option<f64>,
    pub is_safe: bool,
    /// Human-readable reason when `is_safe` is false.
    pub unsafe_reason: Option<String>,
}

/// Outcome of bid selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Safe bids, sorted by price ascending; ties keep first-seen order.
    pub safe: Vec<ScoredBid>,
    /// Bids rejected by policy or price parsing.
    pub rejected: Vec<ScoredBid>,
}

impl Selection {
    /// The winning bid: cheapest safe bid, first-seen on ties.
    pub fn cheapest(&self) -> Option<&ScoredBid> {
        self.safe.first()
    }
}

/// Filter bids against the deny policy and order the survivors by price.
///
/// A bid whose price does not parse as a finite number is rejected rather
/// than treated as zero — an unparseable amount must never become the
/// "cheapest" bid.
pub fn select(bids: &[Bid], shape: DeployShape, policy: &DenyPolicy) -> Selection {
    let mut selection = Selection::default();

    for bid in bids {
        if let Some(reason) = policy.rejection(&bid.provider, shape) {
            selection.rejected.push(ScoredBid {
                bid: bid.clone(),
                price: bid.price_amount.parse::<f64>().ok().filter(|p| p.is_finite()),
                is_safe: false,
                unsafe_reason: Some(reason),
            });
            continue;
        }

        match bid.price_amount.parse::<f64>() {
            Ok(price) if price.is_finite() && price >= 0.0 => {
                selection.safe.push(ScoredBid {
                    bid: bid.clone(),
                    price: Some(price),
                    is_safe: true,
                    unsafe_reason: None,
                });
            }
            _ => {
                warn!(
                    provider = %bid.provider,
                    amount = %bid.price_amount,
                    "dropping bid with unparseable price"
                );
                selection.rejected.push(ScoredBid {
                    bid: bid.clone(),
                    price: None,
                    is_safe: false,
                    unsafe_reason: Some(format!(
                        "price {:?} did not parse as a number",
                        bid.price_amount
                    )),
                });
            }
        }
    }

    // Stable sort keeps first-seen order on equal prices.
    selection
        .safe
        .sort_by(|a, b| a.price.partial_cmp(&b.price).expect("finite prices"));
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(provider: &str, amount: &str) -> Bid {
        Bid {
            provider: provider.to_string(),
            gseq: 1,
            oseq: 1,
            price_amount: amount.to_string(),
            price_denom: "uakt".to_string(),
        }
    }

    fn policy() -> DenyPolicy {
        DenyPolicy {
            blocked: ["badguy".to_string()].into(),
            exposed_blocked: ["unaudited".to_string()].into(),
        }
    }

    #[test]
    fn cheapest_safe_bid_wins() {
        let bids = vec![bid("p1", "3.0"), bid("p2", "1.5"), bid("p3", "2.0")];
        let selection = select(&bids, DeployShape::Standalone, &policy());

        assert_eq!(selection.safe.len(), 3);
        assert_eq!(selection.cheapest().unwrap().bid.provider, "p2");
    }

    #[test]
    fn blocked_provider_never_in_safe_bids() {
        let bids = vec![bid("badguy", "0.1"), bid("p1", "5.0")];
        let selection = select(&bids, DeployShape::Standalone, &policy());

        assert_eq!(selection.safe.len(), 1);
        assert_eq!(selection.cheapest().unwrap().bid.provider, "p1");
        assert_eq!(selection.rejected.len(), 1);
        assert!(!selection.rejected[0].is_safe);
        assert!(selection.rejected[0]
            .unsafe_reason
            .as_deref()
            .unwrap()
            .contains("block list"));
    }

    #[test]
    fn shape_widens_the_denylist() {
        let bids = vec![bid("unaudited", "0.5"), bid("p1", "2.0")];

        // Standalone (proxy-only) tolerates the unaudited provider.
        let standalone = select(&bids, DeployShape::Standalone, &policy());
        assert_eq!(standalone.cheapest().unwrap().bid.provider, "unaudited");

        // Direct exposure does not.
        let exposed = select(&bids, DeployShape::Exposed, &policy());
        assert_eq!(exposed.cheapest().unwrap().bid.provider, "p1");
        assert_eq!(exposed.rejected.len(), 1);
    }

    #[test]
    fn unparseable_price_is_rejected_not_zero() {
        let bids = vec![bid("p1", "not-a-number"), bid("p2", "4.0")];
        let selection = select(&bids, DeployShape::Standalone, &policy());

        // The unparseable bid must not become the "cheapest".
        assert_eq!(selection.cheapest().unwrap().bid.provider, "p2");
        assert_eq!(selection.rejected.len(), 1);
        assert_eq!(selection.rejected[0].price, None);
    }

    #[test]
    fn negative_and_non_finite_prices_are_rejected() {
        let bids = vec![bid("p1", "-1.0"), bid("p2", "inf"), bid("p3", "1.0")];
        let selection = select(&bids, DeployShape::Standalone, &policy());
        assert_eq!(selection.safe.len(), 1);
        assert_eq!(selection.cheapest().unwrap().bid.provider, "p3");
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let bids = vec![bid("p1", "1.0"), bid("p2", "1.0"), bid("p3", "1.0")];
        let selection = select(&bids, DeployShape::Standalone, &policy());
        let order: Vec<&str> = selection.safe.iter().map(|s| s.bid.provider.as_str()).collect();
        assert_eq!(order, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let bids = vec![bid("p2", "2.0"), bid("p1", "1.0"), bid("badguy", "0.5")];
        let a = select(&bids, DeployShape::Standalone, &policy());
        let b = select(&bids, DeployShape::Standalone, &policy());

        assert_eq!(a.safe, b.safe);
        assert_eq!(a.rejected, b.rejected);
    }

    #[test]
    fn empty_input_selects_nothing() {
        let selection = select(&[], DeployShape::Standalone, &policy());
        assert!(selection.safe.is_empty());
        assert!(selection.cheapest().is_none());
    }
}
