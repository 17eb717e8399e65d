//! static-egress-operator: routes traffic for declared destination networks
//! through a stable set of NAT gateways

pub mod config;
pub mod configmap;
pub mod controller;
pub mod health;
pub mod metrics;
pub mod provider;
pub mod source;
pub mod telemetry;

pub use config::OperatorConfig;
pub use controller::EgressController;
