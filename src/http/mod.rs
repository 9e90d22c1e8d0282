//! HTTP surface: the admission guard middleware and the service router.

mod extract;
mod guard;
mod server;

pub use extract::{api_token, client_ip, DEFAULT_CLIENT_IP};
pub use guard::{
    admission_guard, AdmissionGuard, ErrorBody, LIMIT_EXCEEDED_MESSAGE, RATE_LIMIT_LIMIT,
    RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
};
pub use server::{router, HttpServer};
