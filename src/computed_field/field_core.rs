//! # Field core
//!
//! The operator-specific part of a field. Every variant of the closed `FieldCore` enum
//! implements `ComputedFieldCore`; `enum_dispatch` turns the enum into a statically
//! dispatched implementation of the trait, so adding a variant without implementing every
//! capability is a compile error.
//!
//! Kernels receive a `FieldContext` naming the field being evaluated, its ordered source
//! fields and the module to evaluate those sources through. Sources are evaluated with the
//! same `FieldCache`, so shared sub-graphs are evaluated once per location.
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::FieldCache;
use crate::computed_field::field_derivative::FieldDerivative;
use crate::computed_field::field_module::{FieldId, FieldModule};
use crate::computed_field::finite_difference::evaluate_derivative_finite_difference;
use crate::computed_field::source_fields::{Constant, External};
use crate::computed_field::vector_operators::{
    CrossProduct, CubicTextureCoordinates, DotProduct, Magnitude, Normalise, SumComponents,
};
use enum_dispatch::enum_dispatch;
use nalgebra::{DMatrix, DVector};
use strum_macros::{Display, EnumIter};

/// Kind of operator, also the command keyword of the field type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum FieldKind {
    Constant,
    External,
    Normalise,
    CrossProduct,
    DotProduct,
    Magnitude,
    SumComponents,
    CubicTextureCoordinates,
}

/// Everything a kernel needs to know about the field it evaluates
pub struct FieldContext<'a> {
    pub module: &'a FieldModule,
    pub field: FieldId,
    pub name: &'a str,
    pub source_fields: &'a [FieldId],
    pub number_of_components: usize,
}

impl<'a> FieldContext<'a> {
    pub fn source(&self, index: usize) -> FieldId {
        self.source_fields[index]
    }

    pub fn evaluate_source(
        &self,
        cache: &mut FieldCache,
        index: usize,
    ) -> Result<DVector<f64>, FieldError> {
        self.module.evaluate_cached(cache, self.source(index))
    }

    pub fn evaluate_source_derivative(
        &self,
        cache: &mut FieldCache,
        index: usize,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        self.module
            .evaluate_derivative_cached(cache, self.source(index), derivative)
    }

    pub fn source_tree_order(&self, index: usize, derivative: &FieldDerivative) -> usize {
        self.module.tree_order(self.source(index), derivative)
    }

    pub fn source_name(&self, index: usize) -> String {
        self.module
            .get_field_name(self.source(index))
            .unwrap_or_default()
    }

    /// Zero derivative tensor of the right shape for this field
    pub fn zero_derivative(&self, derivative: &FieldDerivative) -> DMatrix<f64> {
        DMatrix::zeros(self.number_of_components, derivative.term_count())
    }
}

#[enum_dispatch]
pub trait ComputedFieldCore {
    fn kind(&self) -> FieldKind;

    /// Type name shown in listings
    fn type_string(&self) -> String {
        self.kind().to_string()
    }

    /// Values of the field at the cache location. Must not touch the field's own value cache.
    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError>;

    /// Derivative tensor (components x terms). Operators without a closed form use the
    /// finite-difference estimator.
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        evaluate_derivative_finite_difference(ctx, cache, derivative)
    }

    /// Highest order of `derivative`'s kind that can be non-zero, capped at its total order:
    /// 0 constant, 1 linear, larger for non-linear dependence.
    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative)
    -> usize;

    fn assign(
        &self,
        ctx: &FieldContext<'_>,
        _cache: &mut FieldCache,
        _values: &DVector<f64>,
    ) -> Result<(), FieldError> {
        Err(FieldError::NotAssignable(ctx.name.to_string()))
    }

    /// true if `other` is the same kind of operator with the same settings
    fn compare(&self, other: &FieldCore) -> bool;

    /// Command arguments following the type keyword
    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String;

    /// Operator-specific lines for `list_field`
    fn list_details(&self, _ctx: &FieldContext<'_>) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[enum_dispatch(ComputedFieldCore)]
#[derive(Clone, Debug)]
pub enum FieldCore {
    Constant(Constant),
    External(External),
    Normalise(Normalise),
    CrossProduct(CrossProduct),
    DotProduct(DotProduct),
    Magnitude(Magnitude),
    SumComponents(SumComponents),
    CubicTextureCoordinates(CubicTextureCoordinates),
}

/// Tree order of a non-linear function of its sources: constant if all sources are,
/// otherwise nothing vanishes up to the requested order
// conservative: a linear source still reports the full order, so no shortcut is taken
pub(crate) fn nonlinear_tree_order(ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
    let constant = (0..ctx.source_fields.len()).all(|i| ctx.source_tree_order(i, derivative) == 0);
    if constant { 0 } else { derivative.total_order() }
}

/// Source field names joined for command strings and listings
pub(crate) fn source_names(ctx: &FieldContext<'_>) -> String {
    (0..ctx.source_fields.len())
        .map(|i| ctx.source_name(i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A complete, validated operator definition: what a field is made of
#[derive(Clone, Debug)]
pub struct FieldDefinition {
    pub core: FieldCore,
    pub source_fields: Vec<FieldId>,
    pub number_of_components: usize,
}
