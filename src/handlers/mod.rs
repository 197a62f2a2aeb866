pub mod admin;
mod health;
mod session;

pub use health::{health_check, readiness_check};
pub use session::{current_session, logout_all};
