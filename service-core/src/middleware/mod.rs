pub mod client_ip;
pub mod tracing;

pub use client_ip::client_ip;
pub use self::tracing::{REQUEST_ID_HEADER, request_id_middleware};
