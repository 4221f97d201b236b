//! Transports behind the connection manager

pub mod websocket;

// Re-export the websocket connector
pub use websocket::WebSocketConnector;
