mod collector;
mod state;
mod ux;

use std::sync::Arc;

pub use collector::*;
pub use state::*;
pub use ux::*;

/// Shared handle to a UX implementation.
pub type UxHandle = Arc<dyn Ux>;
