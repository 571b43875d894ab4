//! # bandstack algorithms
//!
//! Pixel-wise band algebra over co-registered rasters.
//!
//! ## Modules
//!
//! - **algebra**: `combine`, normalized difference, scalar ratios, percent
//!   change and formula expressions
//! - **pipeline**: named derived layers with lazy, cached evaluation
//! - **clip**: clipping and masking rasters to a region of interest

pub mod algebra;
pub mod clip;
pub mod pipeline;
pub(crate) mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::algebra::{
        combine, evaluate_formula, normalized_difference, normalized_difference_band,
        percent_change, scalar_ratio, scalar_ratio_shifted, Expression, NumericPolicy,
        ZeroDivision,
    };
    pub use crate::clip::{clip, clip_to_region, mask, ClipParams};
    pub use crate::pipeline::{DerivedLayer, Pipeline, PipelineBuilder, PipelineConfig};
    pub use bandstack_core::prelude::*;
}
