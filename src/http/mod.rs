//! HTTP surface: the admission middleware, the application and admin routers,
//! and the server that runs them.

mod admin;
mod middleware;
mod server;

pub use admin::{admin_router, LimitStatus};
pub use middleware::{admit, Admission, RATE_LIMITED_MESSAGE, STORE_FAILURE_MESSAGE};
pub use server::{application_router, HttpServer};
