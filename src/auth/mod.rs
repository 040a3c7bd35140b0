pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, JwtManager};
pub use middleware::{auth_middleware, CurrentUser};
pub use password::{hash_password, validate_password_policy, verify_password};
