//! # kiln-kernels
//!
//! Operator kernels for kiln tensors, dispatched through a per-device queue.
//!
//! Provides:
//! - `cat` with a batched copy fast path and a strided fallback
//! - Triangular masking (`triu`/`tril`) over arbitrary layouts
//! - `where_` and `isnan` selection helpers
//! - Linear layers with fused element-wise and binary post-ops
//! - Batched LU and SVD behind a pluggable factorization service
//! - A JSON/env configured [`Context`] owning queues and services

pub mod cat;
pub mod config;
pub mod context;
pub mod linalg;
pub mod linear;
pub mod mask;
pub mod runtime;
pub mod select;

pub use cat::{cat, cat_out};
pub use config::{
    CatConfig, KernelConfig, LinalgBackend, LinalgConfig, LinearConfig, RuntimeConfig,
};
pub use context::Context;
pub use linalg::{lu_with_info, svd, svd_out};
pub use linear::{call_linear, linear, LinearOp, PostOpAttr};
pub use mask::{tril, tril_, tril_out, triu, triu_, triu_out};
pub use select::{isnan, where_};
