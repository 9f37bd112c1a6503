//! Single-dispatch copy of a batch of concat inputs.

use kiln_core::Element;

use super::offset::{output_offset, OutputGeometry};
use crate::runtime::{DeviceBuffer, NdRange, Queue, UnsafeSlice};

/// Per-input metadata for one batched-copy dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputDescriptor {
    /// Slot in the source table passed to the kernel.
    pub source: usize,
    /// Storage offset of the input's first element.
    pub source_offset: usize,
    /// Position of the input along the concat dimension of the output.
    pub offset: usize,
    /// Extent of the input along the concat dimension.
    pub dim_size: usize,
    pub nelements: usize,
}

/// Everything a batched-copy dispatch reads besides the metadata.
pub struct BatchedCopyArgs<'a, T, const DIMS: usize> {
    pub output: &'a UnsafeSlice<'a, T>,
    /// Storage offset of the output view.
    pub output_base: usize,
    pub sources: &'a [&'a [T]],
    pub geometry: OutputGeometry<DIMS>,
    pub concat_dim: usize,
    /// Output stride along the concat dimension.
    pub dim_stride: usize,
}

/// Copy every input described by `meta` into the output.
///
/// The grid has one row per input. Along a row, work-items stride over the
/// input's elements so one dispatch handles inputs of any size.
pub fn launch_batched_copy<T: Element, const DIMS: usize>(
    queue: &Queue,
    args: &BatchedCopyArgs<'_, T, DIMS>,
    meta: &DeviceBuffer<InputDescriptor>,
) {
    if meta.is_empty() {
        return;
    }
    let work_group = queue.max_work_group_size();
    let max_elements = meta.as_slice().iter().map(|d| d.nelements).max().unwrap_or(0);
    let groups_per_input = max_elements
        .div_ceil(work_group)
        .clamp(1, queue.max_compute_units().max(1) * 2);
    let range = NdRange::grid(meta.len(), groups_per_input * work_group, 1, work_group);

    let descriptors = meta.as_slice();
    queue.submit_parallel_for("cat_batched_copy", range, |item| {
        let Some(desc) = descriptors.get(item.global_id(0)) else {
            return;
        };
        let source = args.sources[desc.source];
        let base = args.output_base + desc.offset * args.dim_stride;
        let step = item.global_range(1);
        let mut index = item.global_id(1);
        while index < desc.nelements {
            let element_offset =
                output_offset(&args.geometry, desc.dim_size, args.concat_dim, index);
            let value = source[desc.source_offset + index];
            // SAFETY: inputs occupy disjoint slices of the concat dimension and
            // `output_offset` is injective within one input.
            unsafe { args.output.write(base + element_offset, value) };
            index += step;
        }
    });
}
