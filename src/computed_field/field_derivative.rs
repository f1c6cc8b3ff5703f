//! # Field derivative descriptor
//!
//! A `FieldDerivative` names which partial derivatives of a field are requested: derivatives
//! with respect to the xi coordinates of a mesh element, with respect to the parameters held
//! by the field cache, or mixed. Derivatives are full (non-symmetric) tensors, so the number of
//! terms is `mesh_dimension^mesh_order * parameter_count^parameter_order`.
//!
//! Term layout: the mesh variables come first and the parameter variables last, each variable
//! index varying slowest for the first variable. Hence for any derivative of order > 1
//! `term = lower_term * last_variable_count + last_variable`, where `lower_term` indexes the
//! lower derivative returned by `lower_derivative()`. Higher derivatives are therefore built
//! one variable at a time from their lower derivative.
use crate::computed_field::errors::FieldError;
use itertools::Itertools;

/// Kind of variable a derivative is taken with respect to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DerivativeVariable {
    /// element xi coordinate
    Mesh,
    /// entry of the field cache's parameter vector
    Parameter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldDerivative {
    mesh_dimension: usize,
    mesh_order: usize,
    parameter_count: usize,
    parameter_order: usize,
}

impl FieldDerivative {
    /// Derivative of `order` with respect to the xi coordinates of a mesh of `dimension`
    pub fn mesh(dimension: usize, order: usize) -> Result<Self, FieldError> {
        Self::mixed(dimension, order, 0, 0)
    }

    /// Derivative of `order` with respect to `count` cache parameters
    pub fn parameters(count: usize, order: usize) -> Result<Self, FieldError> {
        Self::mixed(0, 0, count, order)
    }

    /// Mixed mesh/parameter derivative. Either part may have order zero, not both.
    pub fn mixed(
        mesh_dimension: usize,
        mesh_order: usize,
        parameter_count: usize,
        parameter_order: usize,
    ) -> Result<Self, FieldError> {
        if mesh_order + parameter_order == 0 {
            return Err(FieldError::DerivativeNotApplicable(
                "derivative order must be at least 1".to_string(),
            ));
        }
        if (mesh_order > 0 && mesh_dimension == 0) || (parameter_order > 0 && parameter_count == 0)
        {
            return Err(FieldError::DerivativeNotApplicable(
                "derivative variables must have a non-zero count".to_string(),
            ));
        }
        // a zero-order part carries no variables
        Ok(FieldDerivative {
            mesh_dimension: if mesh_order > 0 { mesh_dimension } else { 0 },
            mesh_order,
            parameter_count: if parameter_order > 0 { parameter_count } else { 0 },
            parameter_order,
        })
    }

    pub fn mesh_dimension(&self) -> usize {
        self.mesh_dimension
    }

    pub fn mesh_order(&self) -> usize {
        self.mesh_order
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn parameter_order(&self) -> usize {
        self.parameter_order
    }

    pub fn total_order(&self) -> usize {
        self.mesh_order + self.parameter_order
    }

    /// true if both mesh and parameter variables are involved
    pub fn is_mixed(&self) -> bool {
        self.mesh_order > 0 && self.parameter_order > 0
    }

    pub fn mesh_term_count(&self) -> usize {
        self.mesh_dimension.pow(self.mesh_order as u32)
    }

    pub fn parameter_term_count(&self) -> usize {
        self.parameter_count.pow(self.parameter_order as u32)
    }

    /// Number of independent scalar slots per field component
    pub fn term_count(&self) -> usize {
        self.mesh_term_count() * self.parameter_term_count()
    }

    /// Derivative of order - 1 obtained by dropping the last variable, or None for first
    /// derivatives (whose lower "derivative" is the field value itself).
    pub fn lower_derivative(&self) -> Option<FieldDerivative> {
        if self.total_order() <= 1 {
            return None;
        }
        let lower = if self.parameter_order > 0 {
            FieldDerivative {
                parameter_order: self.parameter_order - 1,
                parameter_count: if self.parameter_order > 1 {
                    self.parameter_count
                } else {
                    0
                },
                ..*self
            }
        } else {
            FieldDerivative {
                mesh_order: self.mesh_order - 1,
                ..*self
            }
        };
        Some(lower)
    }

    /// The variable kind differentiated last, i.e. the one the lower derivative lacks
    pub fn last_variable(&self) -> DerivativeVariable {
        if self.parameter_order > 0 {
            DerivativeVariable::Parameter
        } else {
            DerivativeVariable::Mesh
        }
    }

    /// Number of variables of the last variable kind
    pub fn last_variable_count(&self) -> usize {
        match self.last_variable() {
            DerivativeVariable::Mesh => self.mesh_dimension,
            DerivativeVariable::Parameter => self.parameter_count,
        }
    }

    /// Decode a term index into the xi indices and parameter indices it differentiates by,
    /// in the order the variables were applied.
    pub fn term_variables(&self, term: usize) -> (Vec<usize>, Vec<usize>) {
        let parameter_terms = self.parameter_term_count();
        let mesh_part = term / parameter_terms;
        let parameter_part = term % parameter_terms;
        (
            decode_digits(mesh_part, self.mesh_dimension, self.mesh_order),
            decode_digits(parameter_part, self.parameter_count, self.parameter_order),
        )
    }

    /// All terms in storage order, each as (xi indices, parameter indices)
    pub fn terms(&self) -> Vec<(Vec<usize>, Vec<usize>)> {
        let mesh_terms = (0..self.mesh_order)
            .map(|_| 0..self.mesh_dimension)
            .multi_cartesian_product()
            .collect::<Vec<_>>();
        let parameter_terms = (0..self.parameter_order)
            .map(|_| 0..self.parameter_count)
            .multi_cartesian_product()
            .collect::<Vec<_>>();
        // multi_cartesian_product of nothing yields nothing, but an order-0 part is one empty term
        let mesh_terms = if mesh_terms.is_empty() {
            vec![Vec::new()]
        } else {
            mesh_terms
        };
        let parameter_terms = if parameter_terms.is_empty() {
            vec![Vec::new()]
        } else {
            parameter_terms
        };
        mesh_terms
            .into_iter()
            .cartesian_product(parameter_terms)
            .collect()
    }
}

fn decode_digits(mut value: usize, base: usize, count: usize) -> Vec<usize> {
    let mut digits = vec![0; count];
    for slot in digits.iter_mut().rev() {
        *slot = value % base;
        value /= base;
    }
    digits
}
