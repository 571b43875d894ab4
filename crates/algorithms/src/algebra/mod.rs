//! Band algebra
//!
//! Pixel-wise arithmetic over co-registered rasters and derived layers:
//! - `combine`: generic elementwise engine with shape checking
//! - Named primitives: normalized difference, scalar ratios, percent change
//! - Formula expressions over named operands and constants
//! - `NumericPolicy`: scoped handling of division by zero

mod combine;
mod expression;
mod indices;
mod policy;

pub use combine::combine;
pub use expression::{evaluate_formula, Expression};
pub use indices::{
    normalized_difference, normalized_difference_band, percent_change, scalar_ratio,
    scalar_ratio_shifted,
};
pub use policy::{NumericPolicy, ZeroDivision};
