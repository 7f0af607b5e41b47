use pkg_types::resource::ResourceList;
use std::fmt;

use crate::ledger::Headroom;

/// Outcome of evaluating one migration against quota and grants.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    /// Only positive shortfalls are listed, keyed by resource name.
    Block { shortfall: ResourceList },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Condition message for a block; empty for allow.
    pub fn message(&self) -> String {
        match self {
            Decision::Allow => String::new(),
            Decision::Block { shortfall } => {
                let parts: Vec<String> = shortfall
                    .iter()
                    .map(|(name, amount)| format!("{} short by {}", name, amount))
                    .collect();
                format!("insufficient quota for migration: {}", parts.join(", "))
            }
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "Allow"),
            Decision::Block { shortfall } => write!(f, "Block {}", shortfall),
        }
    }
}

/// Decide whether the estimated extra usage fits.
///
/// For every estimated resource that some quota caps,
/// `shortfall = estimate - quota headroom - grant availability`, clamped at
/// zero. Uncapped resources never block.
pub fn decide(
    estimate: &ResourceList,
    headroom: &Headroom,
    grant_available: &ResourceList,
) -> Decision {
    let shortfall: ResourceList = estimate
        .iter()
        .filter_map(|(name, wanted)| {
            let free = headroom.available(name)?;
            let short = wanted.sub_clamped(free).sub_clamped(grant_available.get(name));
            short.is_positive().then(|| (name.to_string(), short))
        })
        .collect();
    if shortfall.is_empty() {
        Decision::Allow
    } else {
        Decision::Block { shortfall }
    }
}

/// What the quota alone cannot cover: `estimate - headroom` per capped
/// resource, positive entries only. This is what grants must supply.
pub fn quota_deficit(estimate: &ResourceList, headroom: &Headroom) -> ResourceList {
    estimate
        .iter()
        .filter_map(|(name, wanted)| {
            let free = headroom.available(name)?;
            let deficit = wanted.sub_clamped(free);
            deficit.is_positive().then(|| (name.to_string(), deficit))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::quantity::Quantity;
    use proptest::prelude::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries.iter().fold(ResourceList::new(), |l, (k, v)| l.with(k, q(v)))
    }

    #[test]
    fn uncapped_resources_never_block() {
        let estimate = list(&[("memory", "8Gi"), ("cpu", "4")]);
        let headroom = Headroom::from(list(&[("cpu", "4")]));
        assert_eq!(decide(&estimate, &headroom, &ResourceList::new()), Decision::Allow);
    }

    #[test]
    fn exact_headroom_is_enough() {
        let estimate = list(&[("memory", "512Mi")]);
        let headroom = Headroom::from(list(&[("memory", "512Mi")]));
        assert!(decide(&estimate, &headroom, &ResourceList::new()).is_allow());
    }

    #[test]
    fn block_reports_remaining_shortfall() {
        let estimate = list(&[("memory", "1Gi"), ("limits.cpu", "2"), ("cpu", "1")]);
        let headroom = Headroom::from(list(&[
            ("memory", "256Mi"),
            ("limits.cpu", "1"),
            ("cpu", "2"),
        ]));
        let grants = list(&[("memory", "256Mi")]);
        let decision = decide(&estimate, &headroom, &grants);
        assert_eq!(
            decision,
            Decision::Block {
                shortfall: list(&[("limits.cpu", "1"), ("memory", "512Mi")]),
            }
        );
        assert_eq!(
            decision.message(),
            "insufficient quota for migration: limits.cpu short by 1, memory short by 512Mi"
        );
    }

    #[test]
    fn grants_close_the_gap() {
        let estimate = list(&[("memory", "1Gi")]);
        let headroom = Headroom::from(list(&[("memory", "0")]));
        assert!(!decide(&estimate, &headroom, &list(&[("memory", "1023Mi")])).is_allow());
        assert!(decide(&estimate, &headroom, &list(&[("memory", "1Gi")])).is_allow());
    }

    #[test]
    fn deficit_ignores_uncapped_and_covered() {
        let estimate = list(&[("memory", "1Gi"), ("cpu", "1"), ("pods", "1")]);
        let headroom = Headroom::from(list(&[("memory", "256Mi"), ("cpu", "2")]));
        assert_eq!(quota_deficit(&estimate, &headroom), list(&[("memory", "768Mi")]));
    }

    const NAMES: [&str; 3] = ["cpu", "memory", "limits.memory"];

    fn arb_list() -> impl Strategy<Value = ResourceList> {
        proptest::collection::vec(proptest::option::of(0i64..1_000_000), NAMES.len()).prop_map(
            |amounts| {
                NAMES
                    .iter()
                    .zip(amounts)
                    .filter_map(|(name, amount)| {
                        amount.map(|m| (name.to_string(), Quantity::from_millis(m as i128)))
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn allow_iff_every_capped_resource_is_covered(
            estimate in arb_list(),
            bounded in arb_list(),
            grants in arb_list(),
        ) {
            let headroom = Headroom::from(bounded.clone());
            let covered = estimate.iter().all(|(name, wanted)| match bounded.lookup(name) {
                None => true,
                Some(free) => free + grants.get(name) >= wanted,
            });
            prop_assert_eq!(decide(&estimate, &headroom, &grants).is_allow(), covered);
        }

        #[test]
        fn shortfall_is_exact_and_positive(
            estimate in arb_list(),
            bounded in arb_list(),
            grants in arb_list(),
        ) {
            let headroom = Headroom::from(bounded.clone());
            if let Decision::Block { shortfall } = decide(&estimate, &headroom, &grants) {
                for (name, short) in shortfall.iter() {
                    prop_assert!(short.is_positive());
                    let free = bounded.lookup(name).expect("only capped resources block");
                    prop_assert_eq!(short, estimate.get(name) - free - grants.get(name));
                }
                for (name, wanted) in estimate.iter() {
                    if let Some(free) = bounded.lookup(name) {
                        if wanted > free + grants.get(name) {
                            prop_assert!(shortfall.contains(name));
                        }
                    }
                }
            }
        }

        #[test]
        fn deficit_plus_headroom_covers_estimate(
            estimate in arb_list(),
            bounded in arb_list(),
        ) {
            let headroom = Headroom::from(bounded.clone());
            let deficit = quota_deficit(&estimate, &headroom);
            prop_assert!(decide(&estimate, &headroom, &deficit).is_allow());
        }
    }
}
