//! Pure data types for vessel: environments, serialized objects, logs and tasks.
//!
//! This crate is a leaf dependency with no async runtime and no I/O.
//! It exists so that the worker agent, the service front and external
//! clients can share vessel's data model without pulling in the kernel.

pub mod environment;
pub mod error;
pub mod function;
pub mod log;
pub mod object;
pub mod result;
pub mod task;
pub mod value;
pub mod wire;

mod serde_b64;

// Flat re-exports for convenience
pub use environment::*;
pub use error::*;
pub use function::*;
pub use log::*;
pub use object::*;
pub use result::*;
pub use task::*;
pub use value::*;
pub use wire::*;
