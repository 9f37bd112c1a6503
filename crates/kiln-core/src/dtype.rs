use std::fmt;

/// Element types supported by kiln tensors.
///
/// `Bool` is stored as one byte per element holding 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean, one byte per element
    Bool,
    /// 8-bit unsigned integer
    U8,
    /// 8-bit signed integer
    I8,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
}

/// Promotion category, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Bool,
    Integral,
    Floating,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type (excluding `Bool`).
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::U8 | DType::I8 | DType::I32 | DType::I64)
    }

    fn category(&self) -> Category {
        if self.is_float() {
            Category::Floating
        } else if self.is_integer() {
            Category::Integral
        } else {
            Category::Bool
        }
    }

    /// Whether values of `from` may be implicitly cast into `to`.
    ///
    /// Floating to integral and anything-but-bool to bool are rejected.
    pub fn can_cast(from: DType, to: DType) -> bool {
        if from.is_float() && to.is_integer() {
            return false;
        }
        if from != DType::Bool && to == DType::Bool {
            return false;
        }
        true
    }

    /// Promote two dtypes to the type both can be represented in.
    pub fn promote(a: DType, b: DType) -> DType {
        if a == b {
            return a;
        }
        match a.category().cmp(&b.category()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal => match (a, b) {
                // Mixed signedness at one byte widens to the next signed type.
                (DType::U8, DType::I8) | (DType::I8, DType::U8) => DType::I32,
                (DType::F16, DType::BF16) | (DType::BF16, DType::F16) => DType::F32,
                _ => {
                    if a.element_size() >= b.element_size() {
                        a
                    } else {
                        b
                    }
                }
            },
        }
    }

    /// Result type of combining all of `dtypes`. `None` for an empty list.
    pub fn result_type(dtypes: &[DType]) -> Option<DType> {
        let (&first, rest) = dtypes.split_first()?;
        Some(rest.iter().fold(first, |acc, &d| DType::promote(acc, d)))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::U8 => write!(f, "u8"),
            DType::I8 => write!(f, "i8"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
        }
    }
}
