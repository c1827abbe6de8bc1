//! The event router: handler predicates, node-set resolution and external
//! command dispatch.

pub mod handler;
pub mod router;

pub use handler::Handler;
pub use router::EventRouter;
