//! Shape normalization for `(sample, batch, *event)` tensors.
//!
//! Density estimators consume inputs laid out as `(sample_dim, batch_dim,
//! *event_shape)` and conditions as `(batch_dim, *condition_shape)`. Callers
//! hand in tensors of lower rank; the helpers here insert unit axes or swap the
//! two leading axes so every estimator sees one canonical layout. Nothing in
//! this module broadcasts data: sizes never change, only axes are added or
//! reordered.

use ndarray::{ArrayD, Axis};

use crate::error::{Error, Result};

/// Reshape `tensor` to `(sample_dim, batch_dim, *event_shape)`.
///
/// The trailing dimensions must equal `event_shape`. The leading
/// (non-event) dimensions are interpreted as follows:
///
/// - none: `(1, 1, *event)`
/// - one: a batch dimension `(1, n, *event)`, or a sample dimension
///   `(n, 1, *event)` when `leading_is_sample` is set
/// - two: `(sample, batch)` when `leading_is_sample` is set (returned as-is),
///   otherwise `(batch, sample)` and the two axes are swapped
///
/// More than two leading dimensions cannot be expressed in the canonical
/// layout and fail with [`Error::Shape`].
pub fn reshape_to_sample_batch_event<A>(
    tensor: ArrayD<A>,
    event_shape: &[usize],
    leading_is_sample: bool,
) -> Result<ArrayD<A>> {
    check_trailing_shape(tensor.shape(), event_shape)?;
    let leading = tensor.ndim() - event_shape.len();

    match leading {
        0 => Ok(tensor.insert_axis(Axis(0)).insert_axis(Axis(0))),
        1 if leading_is_sample => Ok(tensor.insert_axis(Axis(1))),
        1 => Ok(tensor.insert_axis(Axis(0))),
        2 if leading_is_sample => Ok(tensor),
        2 => {
            let mut swapped = tensor;
            swapped.swap_axes(0, 1);
            Ok(swapped)
        }
        _ => Err(Error::Shape(format!(
            "tensor of shape {:?} has {} leading dimensions before event shape {:?}; \
             at most two (sample, batch) are supported",
            tensor.shape(),
            leading,
            event_shape
        ))),
    }
}

/// Check that the trailing dimensions of `shape` equal `event_shape`.
pub fn check_trailing_shape(shape: &[usize], event_shape: &[usize]) -> Result<()> {
    if shape.len() < event_shape.len() || &shape[shape.len() - event_shape.len()..] != event_shape
    {
        return Err(Error::Shape(format!(
            "trailing dimensions of shape {:?} do not match event shape {:?}",
            shape, event_shape
        )));
    }
    Ok(())
}

/// Broadcast two batch shapes against each other (numpy rules).
///
/// Shapes are right-aligned; each pair of dimensions must be equal or one of
/// them must be 1.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let ndim = lhs.len().max(rhs.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let l = if i < lhs.len() { lhs[lhs.len() - 1 - i] } else { 1 };
        let r = if i < rhs.len() { rhs[rhs.len() - 1 - i] } else { 1 };
        out[ndim - 1 - i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(Error::Broadcast {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

/// Number of elements described by `shape` (1 for the empty shape).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn reshaped(shape: &[usize], event: &[usize], leading_is_sample: bool) -> Result<Vec<usize>> {
        let t = ArrayD::<f64>::zeros(IxDyn(shape));
        reshape_to_sample_batch_event(t, event, leading_is_sample).map(|t| t.shape().to_vec())
    }

    #[test]
    fn test_canonical_shapes() {
        let cases: &[(&[usize], &[usize], &[usize], bool)] = &[
            (&[3], &[1, 1, 3], &[3], false),
            (&[3], &[1, 1, 3], &[3], true),
            (&[1, 3], &[1, 1, 3], &[3], false),
            (&[1, 3], &[1, 1, 3], &[3], true),
            (&[2, 3], &[1, 2, 3], &[3], false),
            (&[2, 3], &[2, 1, 3], &[3], true),
            (&[1, 2, 3], &[1, 2, 3], &[3], true),
            (&[1, 2, 3], &[2, 1, 3], &[3], false),
            (&[3, 5], &[1, 1, 3, 5], &[3, 5], false),
            (&[3, 5], &[1, 1, 3, 5], &[3, 5], true),
            (&[1, 3, 5], &[1, 1, 3, 5], &[3, 5], false),
            (&[1, 3, 5], &[1, 1, 3, 5], &[3, 5], true),
            (&[2, 3, 5], &[1, 2, 3, 5], &[3, 5], false),
            (&[2, 3, 5], &[2, 1, 3, 5], &[3, 5], true),
            (&[1, 2, 3, 5], &[1, 2, 3, 5], &[3, 5], true),
            (&[1, 2, 3, 5], &[2, 1, 3, 5], &[3, 5], false),
        ];
        for &(input, target, event, leading_is_sample) in cases {
            let out = reshaped(input, event, leading_is_sample).unwrap();
            assert_eq!(
                out, target,
                "input {:?}, event {:?}, leading_is_sample={}",
                input, event, leading_is_sample
            );
        }
    }

    #[test]
    fn test_trailing_mismatch_fails() {
        assert!(matches!(reshaped(&[1, 2, 3], &[1, 5], false), Err(Error::Shape(_))));
        assert!(matches!(reshaped(&[1, 2, 3], &[1, 3], false), Err(Error::Shape(_))));
        assert!(matches!(reshaped(&[3], &[3, 1], false), Err(Error::Shape(_))));
    }

    #[test]
    fn test_too_many_leading_dims_fails() {
        assert!(matches!(reshaped(&[1, 2, 3, 5], &[5], false), Err(Error::Shape(_))));
        assert!(matches!(reshaped(&[4, 1, 2, 3], &[3], true), Err(Error::Shape(_))));
    }

    #[test]
    fn test_swap_keeps_values() {
        let t = ArrayD::from_shape_vec(IxDyn(&[2, 3, 1]), (0..6).map(|v| v as f64).collect())
            .unwrap();
        let out = reshape_to_sample_batch_event(t, &[1], false).unwrap();
        assert_eq!(out.shape(), &[3, 2, 1]);
        // out[s, b] == in[b, s]
        assert_eq!(out[[2, 1, 0]], 5.0);
        assert_eq!(out[[1, 0, 0]], 1.0);
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[], &[4]).unwrap(), vec![4]);
        assert_eq!(broadcast_shapes(&[5], &[5]).unwrap(), vec![5]);
        assert_eq!(broadcast_shapes(&[3, 1], &[4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[3], &[4, 1]).unwrap(), vec![4, 3]);
        assert!(matches!(broadcast_shapes(&[3], &[4]), Err(Error::Broadcast { .. })));
    }
}
