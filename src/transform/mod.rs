//! Tree-to-tree rewrites between analysis and code generation.

pub mod expand;
pub mod optimize;

pub use expand::expand;
pub use optimize::optimize;
