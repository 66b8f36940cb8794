//! Traits shared by every observable flavor, so helpers like [`Wait`] can be written once.

pub mod subscribe;
pub mod wait;

pub use subscribe::*;
pub use wait::*;
