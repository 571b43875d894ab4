//! Scoped numeric policy for band algebra

use serde::{Deserialize, Serialize};

/// What a division by zero produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroDivision {
    /// Any zero denominator yields NaN ("no data")
    #[default]
    Nan,
    /// Plain IEEE-754: `x / 0` is `±inf`, `0 / 0` is NaN
    Ieee,
}

/// Numeric rules applied by one algebra call.
///
/// Passed explicitly to every operation instead of being process-wide
/// state, so two evaluations with different policies never interfere.
/// Division through the policy never panics and never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NumericPolicy {
    #[serde(default)]
    pub zero_division: ZeroDivision,
}

impl NumericPolicy {
    pub fn new(zero_division: ZeroDivision) -> Self {
        Self { zero_division }
    }

    /// IEEE-754 semantics for zero denominators
    pub fn ieee() -> Self {
        Self::new(ZeroDivision::Ieee)
    }

    /// `numerator / denominator` under this policy
    #[inline]
    pub fn div(&self, numerator: f64, denominator: f64) -> f64 {
        if denominator == 0.0 && self.zero_division == ZeroDivision::Nan {
            f64::NAN
        } else {
            numerator / denominator
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_nan() {
        let p = NumericPolicy::default();
        assert!(p.div(1.0, 0.0).is_nan());
        assert!(p.div(0.0, 0.0).is_nan());
        assert!(p.div(-1.0, -0.0).is_nan());
        assert_eq!(p.div(1.0, 4.0), 0.25);
    }

    #[test]
    fn test_ieee() {
        let p = NumericPolicy::ieee();
        assert_eq!(p.div(1.0, 0.0), f64::INFINITY);
        assert_eq!(p.div(-1.0, 0.0), f64::NEG_INFINITY);
        assert!(p.div(0.0, 0.0).is_nan());
    }

    #[test]
    fn test_policy_from_json() {
        let p: NumericPolicy = serde_json::from_str(r#"{"zero_division": "ieee"}"#).unwrap();
        assert_eq!(p, NumericPolicy::ieee());
        let p: NumericPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(p, NumericPolicy::default());
    }
}
