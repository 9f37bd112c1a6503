//! Linear layers with fused post-operations.
//!
//! An operator builds a [`PostOpAttr`] and hands it to the context's
//! [`MatmulFusion`] service. If the service reports that it did not fuse,
//! [`linear`] applies the post-ops to the plain result itself.

pub mod attr;
pub mod fusion;
pub mod ops;
pub mod post_ops;

pub use attr::{BinaryAlgorithm, EltwiseAlgorithm, PostOp, PostOpAttr};
pub use fusion::{CpuMatmulFusion, FusionOutcome, MatmulFusion};
pub use ops::{call_linear, linear, lookup, registered_names, LinearArg, LinearOp};
pub use post_ops::apply_post_ops;
