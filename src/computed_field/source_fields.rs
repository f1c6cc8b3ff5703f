//! # Source (leaf) fields
//!
//! Fields without computed-field sources. `Constant` holds its own values. `External` adapts
//! anything implementing `FieldProvider`: the capability the mesh / basis layer offers to
//! the field graph (values at a location, optionally analytic derivatives and assignment).
//!
//! Two providers come with the crate:
//! - `PolynomialField`: components are polynomials in the element xi coordinates and the
//!   cache parameters; exact derivatives of any order.
//! - `NodalField`: value vectors stored per node, assignable.
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::{EvaluationPoint, FieldCache, NodeId};
use crate::computed_field::field_core::{
    ComputedFieldCore, FieldContext, FieldCore, FieldDefinition, FieldKind,
};
use crate::computed_field::field_derivative::{DerivativeVariable, FieldDerivative};
use crate::computed_field::finite_difference::evaluate_derivative_finite_difference;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

////////////////////////////////////////////////////////////////
//  CONSTANT
////////////////////////////////////////////////////////////////
#[derive(Debug)]
pub struct Constant {
    values: RwLock<DVector<f64>>,
}

impl Clone for Constant {
    fn clone(&self) -> Self {
        Constant::new(self.values())
    }
}

impl Constant {
    pub fn new(values: DVector<f64>) -> Self {
        Constant {
            values: RwLock::new(values),
        }
    }

    pub fn values(&self) -> DVector<f64> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn definition(values: &[f64]) -> Result<FieldDefinition, FieldError> {
        if values.is_empty() {
            return Err(FieldError::ComponentCountMismatch {
                expected: 1,
                found: 0,
            });
        }
        Ok(FieldDefinition {
            core: Constant::new(DVector::from_column_slice(values)).into(),
            source_fields: Vec::new(),
            number_of_components: values.len(),
        })
    }
}

impl ComputedFieldCore for Constant {
    fn kind(&self) -> FieldKind {
        FieldKind::Constant
    }

    fn evaluate(
        &self,
        _ctx: &FieldContext<'_>,
        _cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        Ok(self.values())
    }

    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        _cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        Ok(ctx.zero_derivative(derivative))
    }

    fn derivative_tree_order(
        &self,
        _ctx: &FieldContext<'_>,
        _derivative: &FieldDerivative,
    ) -> usize {
        0
    }

    fn assign(
        &self,
        ctx: &FieldContext<'_>,
        _cache: &mut FieldCache,
        values: &DVector<f64>,
    ) -> Result<(), FieldError> {
        {
            let mut stored = self
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *stored = values.clone();
        }
        info!("constant field '{}' assigned {:?}", ctx.name, values.as_slice());
        ctx.module.field_changed(ctx.field);
        Ok(())
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::Constant(constant) if constant.values() == self.values())
    }

    fn command_arguments(&self, _ctx: &FieldContext<'_>) -> String {
        self.values()
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn list_details(&self, ctx: &FieldContext<'_>) -> Vec<(String, String)> {
        vec![("Values".to_string(), self.command_arguments(ctx))]
    }
}

////////////////////////////////////////////////////////////////
//  EXTERNAL PROVIDERS
////////////////////////////////////////////////////////////////
/// Capability consumed from the mesh / basis layer
pub trait FieldProvider: Send + Sync + fmt::Debug {
    fn type_string(&self) -> String {
        "external".to_string()
    }

    fn number_of_components(&self) -> usize;

    /// Values at the point, or None where the provider is not defined
    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>>;

    /// Analytic derivatives (components x terms); None selects finite differences
    fn evaluate_derivative(
        &self,
        _point: &EvaluationPoint<'_>,
        _derivative: &FieldDerivative,
    ) -> Option<DMatrix<f64>> {
        None
    }

    fn derivative_tree_order(&self, derivative: &FieldDerivative) -> usize {
        derivative.total_order()
    }

    fn is_assignable(&self) -> bool {
        false
    }

    /// Store values at the point; false if they cannot be stored there
    fn assign(&self, _point: &EvaluationPoint<'_>, _values: &DVector<f64>) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
pub struct External {
    provider: Arc<dyn FieldProvider>,
}

impl External {
    pub fn new(provider: Arc<dyn FieldProvider>) -> Self {
        External { provider }
    }

    pub fn provider(&self) -> &Arc<dyn FieldProvider> {
        &self.provider
    }

    pub fn definition(provider: Arc<dyn FieldProvider>) -> Result<FieldDefinition, FieldError> {
        let number_of_components = provider.number_of_components();
        if number_of_components == 0 {
            return Err(FieldError::ComponentCountMismatch {
                expected: 1,
                found: 0,
            });
        }
        Ok(FieldDefinition {
            core: External::new(provider).into(),
            source_fields: Vec::new(),
            number_of_components,
        })
    }
}

impl ComputedFieldCore for External {
    fn kind(&self) -> FieldKind {
        FieldKind::External
    }

    fn type_string(&self) -> String {
        self.provider.type_string()
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let point = cache.evaluation_point()?;
        match self.provider.evaluate(&point) {
            Some(values) if values.len() == ctx.number_of_components => Ok(values),
            Some(values) => Err(FieldError::ComponentCountMismatch {
                expected: ctx.number_of_components,
                found: values.len(),
            }),
            None => Err(FieldError::NotDefinedAtLocation(ctx.name.to_string())),
        }
    }

    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        let analytic = {
            let point = cache.evaluation_point()?;
            self.provider.evaluate_derivative(&point, derivative)
        };
        match analytic {
            Some(values)
                if values.nrows() == ctx.number_of_components
                    && values.ncols() == derivative.term_count() =>
            {
                Ok(values)
            }
            Some(_) => Err(FieldError::DerivativeNotApplicable(format!(
                "provider of '{}' returned a derivative of the wrong shape",
                ctx.name
            ))),
            None => evaluate_derivative_finite_difference(ctx, cache, derivative),
        }
    }

    fn derivative_tree_order(
        &self,
        _ctx: &FieldContext<'_>,
        derivative: &FieldDerivative,
    ) -> usize {
        self.provider
            .derivative_tree_order(derivative)
            .min(derivative.total_order())
    }

    fn assign(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        values: &DVector<f64>,
    ) -> Result<(), FieldError> {
        if !self.provider.is_assignable() {
            return Err(FieldError::NotAssignable(ctx.name.to_string()));
        }
        let accepted = {
            let point = cache.evaluation_point()?;
            self.provider.assign(&point, values)
        };
        if !accepted {
            warn!("field '{}' rejected assignment at {:?}", ctx.name, cache.location());
            return Err(FieldError::AssignRejected(format!(
                "field '{}' cannot store values at this location",
                ctx.name
            )));
        }
        ctx.module.field_changed(ctx.field);
        Ok(())
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::External(external) if Arc::ptr_eq(&external.provider, &self.provider))
    }

    fn command_arguments(&self, _ctx: &FieldContext<'_>) -> String {
        self.provider.type_string()
    }
}

////////////////////////////////////////////////////////////////
//  POLYNOMIAL PROVIDER
////////////////////////////////////////////////////////////////
/// coefficient * prod(xi_k ^ xi_powers[k]) * prod(p_j ^ parameter_powers[j])
#[derive(Clone, Debug, PartialEq)]
pub struct Monomial {
    pub coefficient: f64,
    pub xi_powers: Vec<u32>,
    pub parameter_powers: Vec<u32>,
}

impl Monomial {
    pub fn new(coefficient: f64, xi_powers: &[u32], parameter_powers: &[u32]) -> Self {
        Monomial {
            coefficient,
            xi_powers: xi_powers.to_vec(),
            parameter_powers: parameter_powers.to_vec(),
        }
    }

    pub fn constant(coefficient: f64) -> Self {
        Monomial::new(coefficient, &[], &[])
    }

    fn xi_degree(&self) -> usize {
        self.xi_powers.iter().map(|&p| p as usize).sum()
    }

    fn parameter_degree(&self) -> usize {
        self.parameter_powers.iter().map(|&p| p as usize).sum()
    }

    /// Value of the monomial differentiated by the listed variables
    fn evaluate_derivative(
        &self,
        xi: &DVector<f64>,
        parameters: &DVector<f64>,
        xi_variables: &[usize],
        parameter_variables: &[usize],
    ) -> f64 {
        let mut xi_powers = self.xi_powers.clone();
        xi_powers.resize(xi.len(), 0);
        let mut parameter_powers = self.parameter_powers.clone();
        parameter_powers.resize(parameters.len(), 0);
        let mut coefficient = self.coefficient;
        for &k in xi_variables {
            if xi_powers[k] == 0 {
                return 0.0;
            }
            coefficient *= xi_powers[k] as f64;
            xi_powers[k] -= 1;
        }
        for &j in parameter_variables {
            if parameter_powers[j] == 0 {
                return 0.0;
            }
            coefficient *= parameter_powers[j] as f64;
            parameter_powers[j] -= 1;
        }
        let xi_product: f64 = xi
            .iter()
            .zip(xi_powers.iter())
            .map(|(x, &p)| x.powi(p as i32))
            .product();
        let parameter_product: f64 = parameters
            .iter()
            .zip(parameter_powers.iter())
            .map(|(x, &p)| x.powi(p as i32))
            .product();
        coefficient * xi_product * parameter_product
    }
}

/// Vector field whose components are polynomials in element xi and cache parameters.
/// Defined at mesh locations of its dimension when the cache carries its parameters.
#[derive(Clone, Debug)]
pub struct PolynomialField {
    mesh_dimension: usize,
    parameter_count: usize,
    components: Vec<Vec<Monomial>>,
}

impl PolynomialField {
    pub fn new(mesh_dimension: usize, parameter_count: usize) -> Self {
        PolynomialField {
            mesh_dimension,
            parameter_count,
            components: Vec::new(),
        }
    }

    /// Append a component; powers beyond the field's variables are rejected
    pub fn with_component(mut self, monomials: Vec<Monomial>) -> Result<Self, FieldError> {
        for monomial in &monomials {
            if monomial.xi_powers.len() > self.mesh_dimension
                || monomial.parameter_powers.len() > self.parameter_count
            {
                return Err(FieldError::ComponentCountMismatch {
                    expected: self.mesh_dimension,
                    found: monomial.xi_powers.len(),
                });
            }
        }
        self.components.push(monomials);
        Ok(self)
    }

    /// Affine field `offset + gradient * xi`, one row of `gradient` per component
    pub fn affine(offset: &[f64], gradient: &DMatrix<f64>) -> Result<Self, FieldError> {
        let mesh_dimension = gradient.ncols();
        let mut field = PolynomialField::new(mesh_dimension, 0);
        for (c, &constant) in offset.iter().enumerate() {
            let mut monomials = vec![Monomial::constant(constant)];
            for k in 0..mesh_dimension {
                let mut powers = vec![0; mesh_dimension];
                powers[k] = 1;
                monomials.push(Monomial::new(gradient[(c, k)], &powers, &[]));
            }
            field = field.with_component(monomials)?;
        }
        Ok(field)
    }

    fn variables<'a>(
        &self,
        point: &EvaluationPoint<'a>,
    ) -> Option<(&'a DVector<f64>, &'a DVector<f64>)> {
        let xi = point.xi()?;
        if xi.len() != self.mesh_dimension || point.parameters.len() != self.parameter_count {
            return None;
        }
        Some((xi, point.parameters))
    }
}

impl FieldProvider for PolynomialField {
    fn type_string(&self) -> String {
        "polynomial".to_string()
    }

    fn number_of_components(&self) -> usize {
        self.components.len()
    }

    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>> {
        let (xi, parameters) = self.variables(point)?;
        Some(DVector::from_iterator(
            self.components.len(),
            self.components.iter().map(|monomials| {
                monomials
                    .iter()
                    .map(|m| m.evaluate_derivative(xi, parameters, &[], &[]))
                    .sum::<f64>()
            }),
        ))
    }

    fn evaluate_derivative(
        &self,
        point: &EvaluationPoint<'_>,
        derivative: &FieldDerivative,
    ) -> Option<DMatrix<f64>> {
        let (xi, parameters) = self.variables(point)?;
        let terms = derivative.terms();
        let mut result = DMatrix::zeros(self.components.len(), terms.len());
        for (c, monomials) in self.components.iter().enumerate() {
            for (t, (xi_variables, parameter_variables)) in terms.iter().enumerate() {
                result[(c, t)] = monomials
                    .iter()
                    .map(|m| m.evaluate_derivative(xi, parameters, xi_variables, parameter_variables))
                    .sum();
            }
        }
        Some(result)
    }

    fn derivative_tree_order(&self, derivative: &FieldDerivative) -> usize {
        let degree = |m: &Monomial| {
            if derivative.is_mixed() {
                m.xi_degree() + m.parameter_degree()
            } else {
                match derivative.last_variable() {
                    DerivativeVariable::Mesh => m.xi_degree(),
                    DerivativeVariable::Parameter => m.parameter_degree(),
                }
            }
        };
        self.components
            .iter()
            .flatten()
            .map(degree)
            .max()
            .unwrap_or(0)
            .min(derivative.total_order())
    }
}

////////////////////////////////////////////////////////////////
//  NODAL PROVIDER
////////////////////////////////////////////////////////////////
/// Values stored at nodes; undefined at nodes without values and away from nodes
#[derive(Debug)]
pub struct NodalField {
    number_of_components: usize,
    values: RwLock<HashMap<NodeId, DVector<f64>>>,
}

impl NodalField {
    pub fn new(number_of_components: usize) -> Self {
        NodalField {
            number_of_components,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_node_values(&self, node: NodeId, values: &[f64]) -> Result<(), FieldError> {
        if values.len() != self.number_of_components {
            return Err(FieldError::ComponentCountMismatch {
                expected: self.number_of_components,
                found: values.len(),
            });
        }
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node, DVector::from_column_slice(values));
        Ok(())
    }

    pub fn node_values(&self, node: NodeId) -> Option<DVector<f64>> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&node)
            .cloned()
    }
}

impl FieldProvider for NodalField {
    fn type_string(&self) -> String {
        "nodal".to_string()
    }

    fn number_of_components(&self) -> usize {
        self.number_of_components
    }

    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>> {
        self.node_values(point.node()?)
    }

    fn evaluate_derivative(
        &self,
        point: &EvaluationPoint<'_>,
        derivative: &FieldDerivative,
    ) -> Option<DMatrix<f64>> {
        self.node_values(point.node()?)?;
        Some(DMatrix::zeros(
            self.number_of_components,
            derivative.term_count(),
        ))
    }

    fn derivative_tree_order(&self, _derivative: &FieldDerivative) -> usize {
        0
    }

    fn is_assignable(&self) -> bool {
        true
    }

    fn assign(&self, point: &EvaluationPoint<'_>, values: &DVector<f64>) -> bool {
        let Some(node) = point.node() else {
            return false;
        };
        let mut stored = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match stored.get_mut(&node) {
            Some(node_values) if values.len() == self.number_of_components => {
                *node_values = values.clone();
                true
            }
            _ => false,
        }
    }
}
