//! HTTP surface: the admission API and an embeddable middleware.

mod handlers;
mod http;
mod middleware;

pub use handlers::{verdict_response, ADMIN_TOKEN_HEADER};
pub use http::{router, HttpServer};
pub use middleware::{admission_middleware, REMAINING_HEADER, RESET_HEADER};
