//! Shared foundation for the Stratus control plane: CRD types, errors,
//! labels, retry helpers, and the idempotent apply/delete primitives the
//! reconcilers are built on.

pub mod apply;
pub mod crd;
pub mod error;
pub mod labels;
pub mod retry;

pub use error::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;
