//! Handoff agent CLI - hands a delivery to a reviewer and waits for feedback

pub mod client;
pub mod messages;
pub mod wait;

pub use client::{ClientError, HandoffClient};
pub use messages::{CancelReason, Outcome};
pub use wait::{Finalizer, WaitConfig, WaitRequest, Waiter};
