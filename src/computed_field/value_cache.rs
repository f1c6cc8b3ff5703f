//! Per-field, per-cache storage of evaluated values and derivatives.
//!
//! A value cache moves through `Unevaluated -> Valid -> Invalidated -> Unevaluated`. It is
//! valid only for the location token it was filled at; an older token or an explicit
//! invalidation makes it stale and the next access resets it to `Unevaluated`.
use crate::computed_field::field_derivative::FieldDerivative;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Unevaluated,
    Valid,
    Invalidated,
}

/// Derivative tensor of one field for one `FieldDerivative`:
/// rows are field components, columns are derivative terms.
#[derive(Clone, Debug)]
pub struct DerivativeValueCache {
    pub derivative: FieldDerivative,
    pub values: DMatrix<f64>,
}

impl DerivativeValueCache {
    pub fn new(derivative: FieldDerivative, values: DMatrix<f64>) -> Self {
        DerivativeValueCache { derivative, values }
    }

    pub fn zeros(derivative: FieldDerivative, number_of_components: usize) -> Self {
        DerivativeValueCache {
            derivative,
            values: DMatrix::zeros(number_of_components, derivative.term_count()),
        }
    }

    pub fn term_count(&self) -> usize {
        self.values.ncols()
    }

    /// values flattened component by component, `number_of_components * term_count` long
    pub fn as_flat(&self) -> Vec<f64> {
        self.values
            .row_iter()
            .flat_map(|row| row.iter().copied().collect::<Vec<_>>())
            .collect()
    }
}

/// Cached values of a real-valued field
#[derive(Clone, Debug)]
pub struct RealFieldValueCache {
    state: CacheState,
    token: u64,
    values: Option<DVector<f64>>,
    derivatives: HashMap<FieldDerivative, DerivativeValueCache>,
}

impl RealFieldValueCache {
    pub fn new() -> Self {
        RealFieldValueCache {
            state: CacheState::Unevaluated,
            token: 0,
            values: None,
            derivatives: HashMap::new(),
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// State as seen from a cache currently at `token`
    pub fn state_at(&self, token: u64) -> CacheState {
        if self.token != token && self.state == CacheState::Valid {
            CacheState::Invalidated
        } else {
            self.state
        }
    }

    /// Bring the cache up to `token`; anything stored for another token or explicitly
    /// invalidated is discarded.
    pub fn refresh(&mut self, token: u64) {
        if self.token != token {
            self.invalidate();
        }
        if self.state == CacheState::Invalidated {
            self.values = None;
            self.derivatives.clear();
            self.state = CacheState::Unevaluated;
        }
        self.token = token;
    }

    pub fn invalidate(&mut self) {
        if self.state == CacheState::Valid || !self.derivatives.is_empty() {
            self.state = CacheState::Invalidated;
        }
    }

    pub fn values(&self) -> Option<&DVector<f64>> {
        match self.state {
            CacheState::Valid => self.values.as_ref(),
            _ => None,
        }
    }

    pub fn set_values(&mut self, values: DVector<f64>) {
        if self.state == CacheState::Invalidated {
            self.derivatives.clear();
        }
        self.values = Some(values);
        self.state = CacheState::Valid;
    }

    pub fn derivative(&self, derivative: &FieldDerivative) -> Option<&DerivativeValueCache> {
        if self.state == CacheState::Invalidated {
            return None;
        }
        self.derivatives.get(derivative)
    }

    /// Derivatives may be cached before the values themselves are; a derivative-only cache
    /// is still tied to the current token.
    pub fn set_derivative(&mut self, cache: DerivativeValueCache) {
        if self.state == CacheState::Invalidated {
            self.values = None;
            self.derivatives.clear();
            self.state = CacheState::Unevaluated;
        }
        self.derivatives.insert(cache.derivative, cache);
    }
}

impl Default for RealFieldValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_cache_lifecycle() {
        let mut cache = RealFieldValueCache::new();
        cache.refresh(1);
        assert_eq!(cache.state(), CacheState::Unevaluated);
        assert!(cache.values().is_none());
        cache.set_values(DVector::from_vec(vec![1.0, 2.0]));
        assert_eq!(cache.state(), CacheState::Valid);
        assert_eq!(cache.values().unwrap()[1], 2.0);

        cache.invalidate();
        assert_eq!(cache.state(), CacheState::Invalidated);
        assert!(cache.values().is_none());
        cache.refresh(1);
        assert_eq!(cache.state(), CacheState::Unevaluated);
    }

    #[test]
    fn test_new_token_discards_values_and_derivatives() {
        let d = FieldDerivative::mesh(2, 1).unwrap();
        let mut cache = RealFieldValueCache::new();
        cache.refresh(3);
        cache.set_values(DVector::from_vec(vec![1.0]));
        cache.set_derivative(DerivativeValueCache::zeros(d, 1));
        assert!(cache.derivative(&d).is_some());
        cache.refresh(4);
        assert!(cache.values().is_none());
        assert!(cache.derivative(&d).is_none());
    }

    #[test]
    fn test_flat_layout_is_component_major() {
        let d = FieldDerivative::mesh(3, 1).unwrap();
        let values = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let cache = DerivativeValueCache::new(d, values);
        assert_eq!(cache.as_flat(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(cache.term_count(), 3);
    }
}
