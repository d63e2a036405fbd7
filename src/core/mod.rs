//! Core Components
//!
//! HTTP transport, clock and scheduler seams shared by every component.

pub mod clock;
pub mod scheduler;
pub mod transport;

pub use clock::*;
pub use scheduler::*;
pub use transport::*;
