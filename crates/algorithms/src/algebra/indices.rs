//! Named band algebra primitives
//!
//! Normalized difference indices, scalar ratio formulas and percent change.
//! Every primitive is a thin wrapper over [`combine`], so shape checking and
//! zero-division handling are the same everywhere.

use super::{combine, NumericPolicy};
use bandstack_core::{Layer, LayerView, Result};

// ---------------------------------------------------------------------------
// Normalized difference
// ---------------------------------------------------------------------------

/// Normalized difference of two operands, band for band:
///
/// `(x - y) / (x + y)`
///
/// For non-negative inputs the result is in [-1, 1]. Pixels where `x + y`
/// is zero follow `policy` (NaN by default).
///
/// # Arguments
/// * `x` - Numerator positive operand (e.g. NIR)
/// * `y` - Numerator negative operand (e.g. red)
pub fn normalized_difference<'a>(
    x: impl Into<LayerView<'a>>,
    y: impl Into<LayerView<'a>>,
    policy: NumericPolicy,
) -> Result<Layer> {
    combine(&[x.into(), y.into()], policy, |v, p| {
        p.div(v[0] - v[1], v[0] + v[1])
    })
}

/// Normalized difference of one selected band pair.
///
/// Picks band `band` (0-based) from both operands and returns a single
/// band. Fails with `BandIndex` when either operand has no such band.
pub fn normalized_difference_band<'a>(
    x: impl Into<LayerView<'a>>,
    y: impl Into<LayerView<'a>>,
    band: usize,
    policy: NumericPolicy,
) -> Result<Layer> {
    let x = x.into().band(band)?;
    let y = y.into().band(band)?;
    normalized_difference(x, y, policy)
}

// ---------------------------------------------------------------------------
// Scalar ratios
// ---------------------------------------------------------------------------

/// `(1 + p*c + x) / (y + p + c)`
pub fn scalar_ratio<'a>(
    x: impl Into<LayerView<'a>>,
    y: impl Into<LayerView<'a>>,
    p: f64,
    c: f64,
    policy: NumericPolicy,
) -> Result<Layer> {
    combine(&[x.into(), y.into()], policy, move |v, pol| {
        pol.div(1.0 + p * c + v[0], v[1] + p + c)
    })
}

/// Structural variant of [`scalar_ratio`] with the scalar terms swapped:
///
/// `(1 + (p + c) + x) / (y + p*c)`
pub fn scalar_ratio_shifted<'a>(
    x: impl Into<LayerView<'a>>,
    y: impl Into<LayerView<'a>>,
    p: f64,
    c: f64,
    policy: NumericPolicy,
) -> Result<Layer> {
    combine(&[x.into(), y.into()], policy, move |v, pol| {
        pol.div(1.0 + (p + c) + v[0], v[1] + p * c)
    })
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Relative change from `a` to `b` in percent:
///
/// `(b - a) / a * 100`
///
/// Usually applied to two algebra outputs (e.g. an index at two dates).
/// Pixels where `a` is zero follow `policy`.
pub fn percent_change<'a>(
    a: impl Into<LayerView<'a>>,
    b: impl Into<LayerView<'a>>,
    policy: NumericPolicy,
) -> Result<Layer> {
    combine(&[a.into(), b.into()], policy, |v, p| {
        p.div(v[1] - v[0], v[0]) * 100.0
    })
}
