//! Convenience re-exports for common kiln-core types.
//!
//! ```rust
//! use kiln_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::Device;
pub use crate::Element;
pub use crate::KilnError;
pub use crate::MemOverlap;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
