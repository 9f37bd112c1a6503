//! Destination offsets for the batched concat copy.

use kiln_core::Tensor;

/// Sizes and strides of the concat output, fixed for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGeometry<const DIMS: usize> {
    pub sizes: [usize; DIMS],
    pub strides: [usize; DIMS],
}

impl<const DIMS: usize> OutputGeometry<DIMS> {
    /// Geometry of `out`. `None` unless `out` has exactly `DIMS` dimensions.
    pub fn of(out: &Tensor) -> Option<Self> {
        if out.ndim() != DIMS {
            return None;
        }
        let mut sizes = [0; DIMS];
        let mut strides = [0; DIMS];
        sizes.copy_from_slice(out.dims());
        strides.copy_from_slice(out.strides());
        Some(Self { sizes, strides })
    }
}

/// Map element `linear_index` of one (contiguous) input to its offset in
/// the output, relative to where that input's slice begins.
///
/// Dimensions are peeled from the innermost outwards. The concat dimension
/// divides by the input's own extent `dim_size`; every other dimension uses
/// the output's size. Dimension 0 takes the remaining quotient.
#[inline]
pub fn output_offset<const DIMS: usize>(
    geometry: &OutputGeometry<DIMS>,
    dim_size: usize,
    concat_dim: usize,
    linear_index: usize,
) -> usize {
    let mut offset = 0;
    let mut index = linear_index;
    for i in (1..DIMS).rev() {
        let size = if i == concat_dim {
            dim_size
        } else {
            geometry.sizes[i]
        };
        let next = index / size;
        offset += (index - next * size) * geometry.strides[i];
        index = next;
    }
    offset + index * geometry.strides[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::DType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_geometry_rank_check() {
        let out = Tensor::zeros(&[2, 3], DType::F32);
        assert!(OutputGeometry::<3>::of(&out).is_none());
        let g = OutputGeometry::<2>::of(&out).unwrap();
        assert_eq!(g.sizes, [2, 3]);
        assert_eq!(g.strides, [3, 1]);
    }

    #[test]
    fn test_dim1_concat_offsets() {
        // out [2, 5], input [2, 2] placed at columns 3..5
        let g = OutputGeometry {
            sizes: [2, 5],
            strides: [5, 1],
        };
        let offsets: Vec<usize> = (0..4).map(|i| output_offset(&g, 2, 1, i)).collect();
        assert_eq!(offsets, vec![0, 1, 5, 6]);
    }

    #[test]
    fn test_rank1() {
        let g = OutputGeometry {
            sizes: [7],
            strides: [1],
        };
        assert_eq!(output_offset(&g, 3, 0, 2), 2);
    }

    #[test]
    fn test_offsets_distinct_and_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let sizes = [rng.gen_range(1..5), rng.gen_range(1..5), rng.gen_range(1..5)];
            let concat_dim = rng.gen_range(0..3);
            let dim_size = rng.gen_range(1..=sizes[concat_dim]);
            let start = sizes[concat_dim] - dim_size;

            let out = Tensor::zeros(&sizes, DType::F32);
            let g = OutputGeometry::<3>::of(&out).unwrap();
            let base = start * g.strides[concat_dim];

            let mut input_shape = sizes;
            input_shape[concat_dim] = dim_size;
            let count: usize = input_shape.iter().product();

            let seen: HashSet<usize> = (0..count)
                .map(|i| base + output_offset(&g, dim_size, concat_dim, i))
                .collect();
            assert_eq!(seen.len(), count);
            assert!(seen.iter().all(|&o| o < out.numel()));
        }
    }

    #[test]
    fn test_strided_output() {
        // out is a transposed [3, 2] view of a [2, 3] buffer
        let base = Tensor::zeros(&[2, 3], DType::F32);
        let out = base.transpose(0, 1).unwrap();
        let g = OutputGeometry::<2>::of(&out).unwrap();
        let offsets: Vec<usize> = (0..6).map(|i| output_offset(&g, 3, 0, i)).collect();
        assert_eq!(offsets, vec![0, 3, 1, 4, 2, 5]);
    }
}
