//! Index selection over raw element bytes using [ndarray] views.
//!
//! Source data is never reinterpreted as numbers: the bytes are viewed as a `u8` array with an
//! extra trailing axis holding the bytes of one element, so a selection moves whole elements
//! regardless of dtype or byte order.

use crate::error::PortalError;
use crate::models;

use ndarray::prelude::*;

/// Returns an array index in numpy semantics to an index with ndarray semantics.
///
/// The resulting value will be clamped such that it is safe for indexing in ndarray.
/// This allows us to accept selections with NumPy's less restrictive semantics.
/// When the stride is negative (`reverse` is `true`), the result is offset by one to allow for
/// Numpy's non-inclusive start and inclusive end in this scenario.
///
/// # Arguments
///
/// * `index`: Selection index
/// * `length`: Length of corresponding axis
/// * `reverse`: Whether the stride is negative
fn to_ndarray_index(index: isize, length: usize, reverse: bool) -> isize {
    let length_isize = isize::try_from(length).unwrap_or(isize::MAX);
    let result = if reverse { index.saturating_add(1) } else { index };
    if index < 0 {
        std::cmp::max(result + length_isize, 0)
    } else {
        std::cmp::min(result, length_isize)
    }
}

/// Convert a [crate::models::Slice] object with indices in numpy semantics to an
/// [ndarray::SliceInfoElem::Slice] with ndarray semantics.
///
/// See [ndarray docs](https://docs.rs/ndarray/0.15.6/ndarray/macro.s.html#negative-step) for
/// information about ndarray's handling of negative strides.
fn to_ndarray_slice(slice: &models::Slice, length: usize) -> ndarray::SliceInfoElem {
    let reverse = slice.stride < 0;
    let start = to_ndarray_index(slice.start, length, reverse);
    let end = to_ndarray_index(slice.end, length, reverse);
    let (start, end) = if reverse { (end, start) } else { (start, end) };
    ndarray::SliceInfoElem::Slice {
        start,
        end: Some(end),
        step: slice.stride,
    }
}

/// Number of indices an ndarray slice visits on an axis.
fn slice_len(elem: &ndarray::SliceInfoElem, length: usize) -> usize {
    match *elem {
        ndarray::SliceInfoElem::Slice { start, end, step } => {
            let start = start.max(0) as usize;
            let end = end.map_or(length, |end| end.max(0) as usize);
            if end <= start {
                0
            } else {
                (end - start).div_ceil(step.unsigned_abs())
            }
        }
        ndarray::SliceInfoElem::Index(_) => 1,
        ndarray::SliceInfoElem::NewAxis => 1,
    }
}

fn full_slice() -> ndarray::SliceInfoElem {
    ndarray::SliceInfoElem::Slice {
        start: 0,
        end: None,
        step: 1,
    }
}

fn slice_elems(selection: &Option<Vec<models::Slice>>, shape: &[usize]) -> Vec<ndarray::SliceInfoElem> {
    match selection {
        Some(selection) => std::iter::zip(selection, shape)
            .map(|(slice, length)| to_ndarray_slice(slice, *length))
            .collect(),
        None => shape.iter().map(|_| full_slice()).collect(),
    }
}

/// Returns an [ndarray] SliceInfo object corresponding to the selection.
pub fn build_slice_info(
    selection: &Option<Vec<models::Slice>>,
    shape: &[usize],
) -> Result<ndarray::SliceInfo<Vec<ndarray::SliceInfoElem>, ndarray::IxDyn, ndarray::IxDyn>, PortalError>
{
    Ok(ndarray::SliceInfo::try_from(slice_elems(selection, shape))?)
}

/// Returns the shape of an array of shape `shape` after applying `selection`.
///
/// # Arguments
///
/// * `shape`: Shape of the source array
/// * `selection`: Optional NumPy-semantics selection, one slice per axis
pub fn selected_shape(shape: &[usize], selection: &Option<Vec<models::Slice>>) -> Vec<usize> {
    std::iter::zip(slice_elems(selection, shape), shape)
        .map(|(elem, length)| slice_len(&elem, *length))
        .collect()
}

/// Applies a selection to C-ordered element bytes, returning the selected elements packed in
/// C order.
///
/// # Arguments
///
/// * `data`: Raw bytes of the whole source array
/// * `shape`: Shape of the source array
/// * `element_size`: Size of one element in bytes
/// * `selection`: Optional NumPy-semantics selection, one slice per axis
pub fn select_bytes(
    data: &[u8],
    shape: &[usize],
    element_size: usize,
    selection: &Option<Vec<models::Slice>>,
) -> Result<Vec<u8>, PortalError> {
    if selection.is_none() {
        return Ok(data.to_vec());
    }
    let mut byte_shape = shape.to_vec();
    byte_shape.push(element_size);
    let array = ArrayView::<u8, _>::from_shape(IxDyn(&byte_shape), data)?;
    let mut elems = slice_elems(selection, shape);
    elems.push(full_slice());
    let slice_info =
        ndarray::SliceInfo::<_, ndarray::IxDyn, ndarray::IxDyn>::try_from(elems)?;
    Ok(array.slice(slice_info).iter().copied().collect())
}
