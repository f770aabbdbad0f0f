mod call_coordinator;
mod event_consumer_impl;
mod event_handler_impl;
mod event_publisher_impl;
mod notifier;
mod port;
mod presence;
mod registry;
mod router;
mod server;
mod session_hub;

pub use call_coordinator::*;
pub use event_consumer_impl::*;
pub use event_handler_impl::*;
pub use event_publisher_impl::*;
pub use notifier::*;
pub use port::*;
pub use presence::*;
pub use registry::*;
pub use router::*;
pub use server::*;
pub use session_hub::*;
