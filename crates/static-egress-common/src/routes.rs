//! Route aggregation
//!
//! Collapses the destinations declared by all resources into the smallest set
//! of routes that still covers every destination. Only strict containment is
//! collapsed: two blocks that merely overlap or sit next to each other are both
//! kept.

use std::collections::BTreeSet;

use ipnet::IpNet;

use crate::model::DesiredState;

/// Computes the minimal non-redundant route set for `configs`.
///
/// Destinations are ordered by size (smallest first, ties broken by their
/// textual form) and every destination whose whole address range lies inside
/// a later, larger or equal block is dropped. The result does not depend on
/// the iteration order of `configs`.
pub fn aggregate_routes(configs: &DesiredState) -> BTreeSet<IpNet> {
    let mut cidrs: Vec<IpNet> = configs.values().flatten().copied().collect();

    cidrs.sort_by_cached_key(|net| (host_bits(net), net.to_string()));

    cidrs
        .iter()
        .enumerate()
        .filter(|(i, net)| {
            !cidrs[i + 1..]
                .iter()
                .any(|block| network_contained(net, block))
        })
        .map(|(_, net)| *net)
        .collect()
}

/// Number of host bits, which orders blocks by address count without
/// overflowing for large IPv6 blocks.
fn host_bits(net: &IpNet) -> u8 {
    net.max_prefix_len() - net.prefix_len()
}

/// Whether the first and last address of `sub_block` both lie inside
/// `super_block`.
fn network_contained(sub_block: &IpNet, super_block: &IpNet) -> bool {
    super_block.contains(&sub_block.network()) && super_block.contains(&sub_block.broadcast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn state(entries: &[(&str, &[&str])]) -> DesiredState {
        entries
            .iter()
            .map(|(name, nets)| {
                (
                    Resource::new(*name, "x"),
                    nets.iter().map(|n| net(n)).collect(),
                )
            })
            .collect()
    }

    fn routes(nets: &[&str]) -> BTreeSet<IpNet> {
        nets.iter().map(|n| net(n)).collect()
    }

    #[test]
    fn test_subnet_covered_by_superblock() {
        let configs = state(&[("a", &["10.0.0.0/16", "10.0.0.0/17"])]);
        assert_eq!(aggregate_routes(&configs), routes(&["10.0.0.0/16"]));
    }

    #[test]
    fn test_disjoint_block_survives() {
        let configs = state(&[("a", &["10.0.0.0/16", "10.0.0.0/17", "10.1.0.0/17"])]);
        assert_eq!(
            aggregate_routes(&configs),
            routes(&["10.0.0.0/16", "10.1.0.0/17"])
        );
    }

    #[test]
    fn test_host_route_inside_network() {
        let configs = state(&[("a", &["192.0.2.10/32"]), ("b", &["192.0.2.0/24"])]);
        assert_eq!(aggregate_routes(&configs), routes(&["192.0.2.0/24"]));
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate_routes(&DesiredState::new()).is_empty());
    }

    #[test]
    fn test_duplicates_across_resources_collapse() {
        let configs = state(&[
            ("a", &["213.95.138.236/32"]),
            ("b", &["213.95.138.236/32"]),
            ("c", &["213.95.138.236/32"]),
        ]);
        assert_eq!(aggregate_routes(&configs), routes(&["213.95.138.236/32"]));
    }

    #[test]
    fn test_equal_size_disjoint_blocks_are_kept() {
        let configs = state(&[("a", &["10.0.0.0/24", "10.0.1.0/24"])]);
        assert_eq!(
            aggregate_routes(&configs),
            routes(&["10.0.0.0/24", "10.0.1.0/24"])
        );
    }

    #[test]
    fn test_adjacent_blocks_are_not_merged() {
        // Two neighbouring /25s cover exactly one /24, but only containment
        // is collapsed.
        let configs = state(&[("a", &["10.0.0.0/25"]), ("b", &["10.0.0.128/25"])]);
        assert_eq!(
            aggregate_routes(&configs),
            routes(&["10.0.0.0/25", "10.0.0.128/25"])
        );
    }

    #[test]
    fn test_chain_of_containment() {
        let configs = state(&[(
            "a",
            &["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24", "10.1.2.3/32"],
        )]);
        assert_eq!(aggregate_routes(&configs), routes(&["10.0.0.0/8"]));
    }

    #[test]
    fn test_result_independent_of_resource_order() {
        let forward = state(&[
            ("a", &["10.0.0.0/17", "172.16.0.0/12"]),
            ("b", &["10.0.0.0/16", "172.16.5.0/24"]),
            ("c", &["8.8.8.8/32"]),
        ]);
        let backward = state(&[
            ("c", &["172.16.5.0/24", "10.0.0.0/16"]),
            ("b", &["8.8.8.8/32"]),
            ("a", &["172.16.0.0/12", "10.0.0.0/17"]),
        ]);

        let expected = routes(&["10.0.0.0/16", "172.16.0.0/12", "8.8.8.8/32"]);
        assert_eq!(aggregate_routes(&forward), expected);
        assert_eq!(aggregate_routes(&backward), expected);
    }

    #[test]
    fn test_network_contained() {
        assert!(network_contained(&net("10.0.0.0/17"), &net("10.0.0.0/16")));
        assert!(network_contained(&net("10.0.0.0/16"), &net("10.0.0.0/16")));
        assert!(!network_contained(&net("10.0.0.0/16"), &net("10.0.0.0/17")));
        assert!(!network_contained(&net("10.1.0.0/17"), &net("10.0.0.0/16")));
    }
}
