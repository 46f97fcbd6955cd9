//! Ownership of bind domains claimed by more than one configuration.

use std::{cmp::Ordering, collections::BTreeMap};

use crate::core::types::CertificateConfig;

/// Domains listed as bind domains by two or more enabled configurations,
/// mapped to the claiming indexes in ascending order.
pub fn conflicts(configs: &[CertificateConfig]) -> BTreeMap<String, Vec<usize>> {
    let mut claims: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, config) in configs.iter().enumerate() {
        if !config.enabled {
            continue;
        }
        for domain in config.bind_domains() {
            let claimants = claims.entry(domain.to_lowercase()).or_default();
            if !claimants.contains(&index) {
                claimants.push(index);
            }
        }
    }
    claims.retain(|_, claimants| claimants.len() > 1);
    claims
}

/// Picks the authoritative configuration among `candidates`: the strictly later
/// expiry wins, then the larger order id. Disabled and out-of-range candidates
/// are ignored. The result does not depend on candidate order.
pub fn pick(candidates: &[usize], configs: &[CertificateConfig]) -> Option<usize> {
    candidates
        .iter()
        .copied()
        .filter(|&index| configs.get(index).is_some_and(|config| config.enabled))
        .max_by(|&a, &b| compare(a, b, configs))
}

fn compare(a: usize, b: usize, configs: &[CertificateConfig]) -> Ordering {
    let (left, right) = (&configs[a], &configs[b]);
    left.expires_at
        .cmp(&right.expires_at)
        .then(left.order_id.cmp(&right.order_id))
        // Identical claims resolve to the earliest entry.
        .then(b.cmp(&a))
}

/// Whether `index` may act on `domain` this pass.
pub fn owns(
    index: usize,
    domain: &str,
    conflicts: &BTreeMap<String, Vec<usize>>,
    configs: &[CertificateConfig],
) -> bool {
    match conflicts.get(&domain.to_lowercase()) {
        None => true,
        Some(candidates) => pick(candidates, configs) == Some(index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BindRule, ValidationMethod};
    use chrono::{TimeZone, Utc};

    fn config(order_id: u64, domains: &[&str], expires: Option<(i32, u32, u32)>) -> CertificateConfig {
        CertificateConfig {
            order_id,
            domain: domains[0].to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            enabled: true,
            use_local_key: false,
            validation_method: ValidationMethod::Auto,
            auto_bind: true,
            bind_rules: vec![],
            expires_at: expires.map(|(y, m, d)| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn later_expiry_wins_shared_domain() {
        let configs = vec![
            config(1, &["shared.example.com"], Some((2030, 1, 1))),
            config(2, &["shared.example.com", "b.example.com"], Some((2031, 1, 1))),
        ];
        let map = conflicts(&configs);
        assert_eq!(map.len(), 1);
        assert_eq!(map["shared.example.com"], vec![0, 1]);
        assert_eq!(pick(&map["shared.example.com"], &configs), Some(1));
        assert!(owns(1, "shared.example.com", &map, &configs));
        assert!(!owns(0, "shared.example.com", &map, &configs));
        assert!(owns(1, "b.example.com", &map, &configs));
    }

    #[test]
    fn equal_expiry_prefers_largest_order_id_in_any_order() {
        let configs = vec![
            config(40, &["shared.example.com"], Some((2030, 6, 1))),
            config(97, &["shared.example.com"], Some((2030, 6, 1))),
            config(12, &["shared.example.com"], Some((2030, 6, 1))),
        ];
        for candidates in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [2, 0, 1]] {
            assert_eq!(pick(&candidates, &configs), Some(1));
        }

        let unset = vec![config(5, &["x.test"], None), config(6, &["x.test"], None)];
        assert_eq!(pick(&[1, 0], &unset), Some(1));
    }

    #[test]
    fn disabled_and_out_of_range_candidates_are_ignored() {
        let mut configs = vec![
            config(1, &["shared.example.com"], Some((2030, 1, 1))),
            config(2, &["shared.example.com"], Some((2031, 1, 1))),
        ];
        configs[1].enabled = false;
        assert!(conflicts(&configs).is_empty());
        assert_eq!(pick(&[0, 1, 7], &configs), Some(0));

        configs[0].enabled = false;
        assert_eq!(pick(&[0, 1], &configs), None);
    }

    #[test]
    fn explicit_bind_rules_define_claims() {
        let mut first = config(1, &["a.example.com", "shared.example.com"], None);
        first.auto_bind = false;
        first.bind_rules = vec![BindRule {
            domain: "a.example.com".into(),
            port: 443,
            site_name: None,
        }];
        let second = config(2, &["shared.example.com"], None);
        assert!(conflicts(&[first, second]).is_empty());
    }
}
