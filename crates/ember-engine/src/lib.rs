pub mod apply;
pub mod detect;
pub mod elevation;
pub mod engine;
pub mod extract;
pub mod monitor;
pub mod pipe;
pub mod plan;
pub mod registration;
pub mod state;
pub mod ux;

pub use apply::{apply, ApplyResult};
pub use detect::detect;
pub use plan::plan;
pub use state::EngineState;
