//! Guarded tool invocation: transports, masking, layered policies, and the
//! guard stack that fronts them.

pub mod executor;
pub mod http;
pub mod masking;
pub mod policy;

pub use executor::ToolExecutor;
pub use policy::{PolicyLayers, PolicyStore};
