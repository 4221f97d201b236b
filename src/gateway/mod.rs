//! Request/response access to the backend API

pub mod client;
pub mod endpoints;
pub mod http;

// Re-export main components
pub use client::{Gateway, SharedGateway};
pub use endpoints::{LoginResult, Page, PageRequest};
pub use http::{ApiRequest, ApiResponse, HttpBackend, Method, ReqwestBackend};
