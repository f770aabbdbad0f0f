mod group_repo_mysql;
mod message_repo_mysql;
mod outbox_repo_mysql;

pub use group_repo_mysql::*;
pub use message_repo_mysql::*;
pub use outbox_repo_mysql::*;

mod repo_tx_mysql;

pub use repo_tx_mysql::*;

mod util;
