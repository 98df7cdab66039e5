pub mod request_id;
pub mod user_rate_limit;

pub use request_id::{make_span_with_request_id, request_id_middleware, RequestId, REQUEST_ID_HEADER};
pub use user_rate_limit::user_rate_limit_middleware;

/// Header identifying the acting user
pub const USER_ID_HEADER: &str = "x-user-id";
