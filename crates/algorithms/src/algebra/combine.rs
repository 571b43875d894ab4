//! Generic elementwise combination of algebra operands

use super::NumericPolicy;
use crate::maybe_rayon::*;
use bandstack_core::{Error, Layer, LayerView, Result};
use ndarray::{Array2, Array3, ArrayView3};

/// Apply `formula` to every pixel of `operands`.
///
/// `formula` receives the values of all operands at one pixel, in operand
/// order, together with `policy`, and returns the output value.
///
/// All operands must have the same kind (band stacks or single bands) and
/// the same `(bands, rows, cols)` shape; anything else is a
/// [`Error::ShapeMismatch`] and nothing is computed. There is no
/// broadcasting. The result is a stack when the operands are stacks and a
/// single band when they are single bands.
///
/// # Example
/// ```ignore
/// let diff = combine(&[a.view(), b.view()], NumericPolicy::default(), |v, p| {
///     p.div(v[0] - v[1], v[0] + v[1])
/// })?;
/// ```
pub fn combine<F>(operands: &[LayerView<'_>], policy: NumericPolicy, formula: F) -> Result<Layer>
where
    F: Fn(&[f64], &NumericPolicy) -> f64 + Sync + Send,
{
    let first = operands.first().ok_or_else(|| Error::InvalidParameter {
        name: "operands",
        value: "[]".into(),
        reason: "at least one operand is required".into(),
    })?;
    check_operands(operands)?;

    let (bands, rows, cols) = first.shape();
    let stacks: Vec<ArrayView3<'_, f64>> = operands.iter().map(|op| op.as_stack()).collect();
    let n = stacks.len();

    // One work item per (band, row), collected in order
    let data: Vec<f64> = (0..bands * rows)
        .into_par_iter()
        .flat_map(|item| {
            let band = item / rows;
            let row = item % rows;
            let mut values = vec![0.0; n];
            let mut row_data = vec![f64::NAN; cols];
            for (col, out) in row_data.iter_mut().enumerate() {
                for (value, stack) in values.iter_mut().zip(&stacks) {
                    *value = stack[(band, row, col)];
                }
                *out = formula(&values, &policy);
            }
            row_data
        })
        .collect();

    if first.is_stack() {
        Ok(Layer::Stack(Array3::from_shape_vec((bands, rows, cols), data)?))
    } else {
        Ok(Layer::Band(Array2::from_shape_vec((rows, cols), data)?))
    }
}

/// Check that every operand matches the first in kind and shape
fn check_operands(operands: &[LayerView<'_>]) -> Result<()> {
    let Some(first) = operands.first() else {
        return Ok(());
    };
    let expected = first.shape();

    for op in &operands[1..] {
        if op.is_stack() != first.is_stack() || op.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: op.shape(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn pair<'a>(a: impl Into<LayerView<'a>>, b: impl Into<LayerView<'a>>) -> [LayerView<'a>; 2] {
        [a.into(), b.into()]
    }

    #[test]
    fn test_combine_stacks_elementwise() {
        let a = Array3::from_shape_fn((2, 3, 4), |(b, r, c)| (b * 12 + r * 4 + c) as f64);
        let b = Array3::from_elem((2, 3, 4), 1.0);

        let out = combine(&pair(a.view(), b.view()), NumericPolicy::default(), |v, _| v[0] + v[1])
            .unwrap();

        let Layer::Stack(out) = out else {
            panic!("expected a stack");
        };
        assert_eq!(out.dim(), (2, 3, 4));
        assert_eq!(out[(1, 2, 3)], 24.0);
        assert_eq!(out[(0, 0, 0)], 1.0);
    }

    #[test]
    fn test_combine_bands_gives_band() {
        let a = Array2::from_elem((3, 3), 6.0);
        let b = Array2::from_elem((3, 3), 3.0);
        let out = combine(&pair(a.view(), b.view()), NumericPolicy::default(), |v, p| {
            p.div(v[0], v[1])
        })
        .unwrap();
        assert_eq!(out, Layer::Band(Array2::from_elem((3, 3), 2.0)));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array3::<f64>::zeros((3, 100, 100));
        let b = Array3::<f64>::zeros((3, 50, 50));
        let result = combine(&pair(a.view(), b.view()), NumericPolicy::default(), |v, _| v[0]);
        assert!(matches!(
            result,
            Err(Error::ShapeMismatch {
                expected: (3, 100, 100),
                actual: (3, 50, 50)
            })
        ));
    }

    #[test]
    fn test_band_count_mismatch() {
        let a = Array3::<f64>::zeros((4, 5, 5));
        let b = Array3::<f64>::zeros((3, 5, 5));
        let result = combine(&pair(a.view(), b.view()), NumericPolicy::default(), |v, _| v[0]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_stack_and_band_never_mix() {
        // Same (1, rows, cols) shape but different kinds
        let a = Array3::<f64>::zeros((1, 5, 5));
        let b = Array2::<f64>::zeros((5, 5));
        let result = combine(&pair(a.view(), b.view()), NumericPolicy::default(), |v, _| v[0]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_no_operands() {
        let result = combine(&[], NumericPolicy::default(), |_, _| 0.0);
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }
}
