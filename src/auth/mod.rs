//! Access token inspection

pub mod token;

// Re-export main components
pub use token::{bearer, inspect_token, Claims};
