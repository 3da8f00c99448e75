//! Device protocols.

pub mod plo;

pub use plo::{PloClient, PloCommand, PloState};
