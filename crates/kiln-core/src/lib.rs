//! # kiln-core
//!
//! Tensor views and storage shared by the kiln operator kernels.
//!
//! Provides:
//! - Dtypes from `Bool` to `F64`, including `F16`/`BF16` via `half`
//! - Reference-counted, lock-protected storage tagged with a device
//! - Strided views (narrow, transpose, permute, reshape) that share storage
//! - Memory overlap analysis and a strided copy-with-cast primitive

pub mod dtype;
pub mod element;
pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod overlap;
pub mod error;
pub mod prelude;

pub use dtype::DType;
pub use element::Element;
pub use device::Device;
pub use storage::{Storage, StorageData};
pub use shape::Shape;
pub use tensor::Tensor;
pub use overlap::MemOverlap;
pub use error::KilnError;

pub type Result<T> = std::result::Result<T, KilnError>;
