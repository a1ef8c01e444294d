pub mod auth;
pub mod cors;
pub mod validation;

pub use auth::{bearer_token, AdminAuth, AdminToken};
pub use cors::create_cors_layer;
pub use validation::ValidatedJson;
