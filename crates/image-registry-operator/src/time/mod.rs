//! Time handling for the credential lifecycle.
//!
//! Account lifetimes, rotation intervals and cache ages are configured with
//! the human readable [`Duration`]. Every component that needs to know the
//! current time asks a [`Clock`] instead of reading the system time directly.

mod clock;
mod duration;
mod serde_impl;

pub use clock::*;
pub use duration::*;
