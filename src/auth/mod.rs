pub use middleware::jwt_auth;
pub use service::{require_student, require_teacher, CredentialService, JwtCredentialService};
pub use token::TokenConfig;
pub use types::{Claims, Principal, Role};

mod middleware;
pub mod service;
mod token;
mod types;
