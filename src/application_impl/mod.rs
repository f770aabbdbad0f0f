mod access_policy_impl;
mod auth_jwt;
mod conversation_service_impl;
mod memory_repos;

pub use access_policy_impl::*;
pub use auth_jwt::*;
pub use conversation_service_impl::*;
pub use memory_repos::*;
