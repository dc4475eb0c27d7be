//! Domain event primitives.
//!
//! Every purchase-attempt transition is expressed as a typed, versioned event.
//! Nothing here persists or transports events; the client logs them and keeps
//! the in-memory attempt only until its result is delivered.

pub mod event;
pub mod handler;

pub use event::Event;
pub use handler::execute;
