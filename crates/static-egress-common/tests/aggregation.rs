use std::collections::BTreeSet;

use static_egress_common::{aggregate_routes, parse_destination, DesiredState, EgressConfig, Resource};

fn config(name: &str, namespace: &str, values: &[&str]) -> EgressConfig {
    EgressConfig::new(
        Resource::new(name, namespace),
        values
            .iter()
            .map(|v| parse_destination(v).expect("test CIDR should parse")),
    )
}

fn apply(state: &mut DesiredState, config: EgressConfig) {
    if config.is_removal() {
        state.remove(&config.resource);
    } else {
        state.insert(config.resource, config.ip_addresses);
    }
}

fn rendered(state: &DesiredState) -> BTreeSet<String> {
    aggregate_routes(state)
        .into_iter()
        .map(|net| net.to_string())
        .collect()
}

#[test]
fn test_routes_follow_config_lifecycle() {
    let mut state = DesiredState::new();

    apply(&mut state, config("partner-a", "default", &["203.0.113.0/24"]));
    apply(
        &mut state,
        config("partner-b", "team", &["203.0.113.7/32", "198.51.100.0/24"]),
    );
    assert_eq!(
        rendered(&state),
        ["198.51.100.0/24", "203.0.113.0/24"]
            .into_iter()
            .map(String::from)
            .collect()
    );

    // Once the covering block goes away the host route becomes visible.
    apply(&mut state, EgressConfig::removed(Resource::new("partner-a", "default")));
    assert_eq!(
        rendered(&state),
        ["198.51.100.0/24", "203.0.113.7/32"]
            .into_iter()
            .map(String::from)
            .collect()
    );

    apply(&mut state, EgressConfig::removed(Resource::new("partner-b", "team")));
    assert!(rendered(&state).is_empty());
}

#[test]
fn test_update_replaces_previous_destinations() {
    let mut state = DesiredState::new();

    apply(&mut state, config("partner", "default", &["192.0.2.0/24"]));
    apply(&mut state, config("partner", "default", &["198.51.100.1/32"]));

    assert_eq!(state.len(), 1);
    assert_eq!(
        rendered(&state),
        ["198.51.100.1/32"].into_iter().map(String::from).collect()
    );
}

#[test]
fn test_unnormalized_input_aggregates_like_normalized() {
    let mut state = DesiredState::new();
    apply(&mut state, config("a", "x", &["10.0.0.5/16", "10.0.200.1/17"]));

    assert_eq!(
        rendered(&state),
        ["10.0.0.0/16"].into_iter().map(String::from).collect()
    );
}
