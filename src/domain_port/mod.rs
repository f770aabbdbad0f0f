mod access;
mod group_repo;
mod message_repo;
mod outbox_repo;
mod presence_store;

mod repo_tx;

pub use access::*;
pub use group_repo::*;
pub use message_repo::*;
pub use outbox_repo::*;
pub use presence_store::*;

pub use repo_tx::*;
