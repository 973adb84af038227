//! The top-level run loop and its supporting passes.

pub mod events;
pub mod filter;
pub mod optimizer;
pub mod response;
pub mod runloop;

pub use events::AgentEvent;
pub use runloop::{Agent, AgentBuilder};
