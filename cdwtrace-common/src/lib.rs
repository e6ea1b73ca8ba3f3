//! Types shared between the cdwtrace library, its CLI and downstream tools.

mod types;

pub use types::*;
