//! Memory overlap analysis between tensor views.

use crate::Tensor;

/// How two views relate in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOverlap {
    /// Disjoint storage or disjoint ranges.
    No,
    /// The touched ranges intersect but differ.
    Partial,
    /// Same storage and the same touched range.
    Full,
}

/// Compare the storage ranges two views can touch.
///
/// Empty views never overlap anything.
pub fn overlap_status(a: &Tensor, b: &Tensor) -> MemOverlap {
    if a.numel() == 0 || b.numel() == 0 || !a.storage().same_storage(b.storage()) {
        return MemOverlap::No;
    }
    let (a_lo, a_hi) = a.storage_span();
    let (b_lo, b_hi) = b.storage_span();
    if a_lo == b_lo && a_hi == b_hi {
        MemOverlap::Full
    } else if a_lo < b_hi && b_lo < a_hi {
        MemOverlap::Partial
    } else {
        MemOverlap::No
    }
}

/// Whether several elements of `t` map to one storage location.
pub fn has_internal_overlap(t: &Tensor) -> bool {
    t.dims()
        .iter()
        .zip(t.strides())
        .any(|(&d, &s)| d > 1 && s == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, Shape};

    #[test]
    fn test_distinct_storage() {
        let a = Tensor::zeros(&[4], DType::F32);
        let b = Tensor::zeros(&[4], DType::F32);
        assert_eq!(overlap_status(&a, &b), MemOverlap::No);
    }

    #[test]
    fn test_full_and_partial() {
        let t = Tensor::zeros(&[6], DType::F32);
        assert_eq!(overlap_status(&t, &t.clone()), MemOverlap::Full);

        let head = t.narrow(0, 0, 4).unwrap();
        let tail = t.narrow(0, 2, 4).unwrap();
        assert_eq!(overlap_status(&head, &tail), MemOverlap::Partial);

        let first = t.narrow(0, 0, 3).unwrap();
        let second = t.narrow(0, 3, 3).unwrap();
        assert_eq!(overlap_status(&first, &second), MemOverlap::No);
    }

    #[test]
    fn test_empty_never_overlaps() {
        let t = Tensor::zeros(&[6], DType::F32);
        let empty = t.narrow(0, 2, 0).unwrap();
        assert_eq!(overlap_status(&t, &empty), MemOverlap::No);
    }

    #[test]
    fn test_internal_overlap() {
        let t = Tensor::zeros(&[3], DType::F32);
        let b = t.broadcast_to(&Shape::new(&[2, 3])).unwrap();
        assert!(has_internal_overlap(&b));
        assert!(!has_internal_overlap(&t));

        let single = Tensor::zeros(&[1], DType::F32)
            .broadcast_to(&Shape::new(&[1]))
            .unwrap();
        assert!(!has_internal_overlap(&single));
    }
}
