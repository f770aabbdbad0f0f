mod call;
mod connection;
mod conversation;
mod message;
mod presence;
mod stream;
mod user;

pub use call::*;
pub use connection::*;
pub use conversation::*;
pub use message::*;
pub use presence::*;
pub use stream::*;
pub use user::*;
