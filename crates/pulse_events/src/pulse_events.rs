//! Pulse Events - Event types and delegation for the control plane
//!
//! Demand events flow in from subscription management and drive plugin
//! scaling. Control events flow out of the control plane to report instance
//! lifecycle and health.
//!
//! `EventController` is an in-process delegate/emitter. Anything else that
//! implements `EventDelegate` and `Emitter` can take its place.

mod controller;
mod event;

pub use controller::*;
pub use event::*;
