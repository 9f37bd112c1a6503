use crate::DType;

/// Errors raised by kiln tensors and operators.
///
/// Every operator validates its arguments before it writes any output, so an
/// `Err` always leaves the output tensor untouched.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error(
        "unsupported operation: the input tensors cannot refer to any of the output \
         memory locations. Found overlap in input tensor {index}"
    )]
    Aliasing { index: usize },

    #[error(
        "unsupported operation: some elements of the output tensor refer to a single \
         memory location"
    )]
    InternalOverlap,

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("input type {from} can't be cast to the desired output type {to}")]
    Cast { from: DType, to: DType },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("dimension {axis} out of range for {ndim}-D tensor")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("cannot reshape tensor of {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("{op}: {}", describe_factorization(.op, .batch, .info))]
    Factorization {
        op: String,
        batch: Option<usize>,
        info: i64,
    },

    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn describe_factorization(op: &str, batch: &Option<usize>, info: &i64) -> String {
    let info = *info;
    let detail = if info < 0 {
        format!("Argument {} has illegal value", -info)
    } else if op == "svd" {
        format!("the algorithm failed to converge; {info} off-diagonal elements did not converge to zero")
    } else {
        format!("U({info},{info}) is zero, singular U")
    };
    match batch {
        Some(b) => format!("For batch {b}: {detail}"),
        None => detail,
    }
}
