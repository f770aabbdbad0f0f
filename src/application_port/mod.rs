mod auth_service;
mod call_service;
mod conversation_service;

pub use auth_service::*;
pub use call_service::*;
pub use conversation_service::*;
