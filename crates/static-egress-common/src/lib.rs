pub mod model;
pub mod routes;
pub mod validation;

pub use model::{DesiredState, EgressConfig, Resource};
pub use routes::aggregate_routes;
pub use validation::{parse_destination, ValidationError, ValidationResult};
