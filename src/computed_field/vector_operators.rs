//! # Vector operators
//!
//! Computed fields built from vector algebra on their source fields:
//!
//! | operator | value | analytic derivatives |
//! |---|---|---|
//! | `Normalise` | `v / abs(v)` | first order |
//! | `CrossProduct` | 90 degree rotation (2D), `a x b` (3D), generalised cross product (4D) | first order |
//! | `DotProduct` | `a . b` | constant factors, first order, pure second order |
//! | `Magnitude` | `abs(a)` (assignable) | first order |
//! | `SumComponents` | `sum a_i` | every order |
//! | `CubicTextureCoordinates` | components over the dominant component | none |
//!
//! Derivatives without a closed-form rule here are estimated by finite differences.
//! A zero-length source vector where a magnitude is divided by follows the module's
//! `ZeroMagnitudePolicy`: either an all-zero result or a `ZeroMagnitude` error.
use crate::Utils::settings::ZeroMagnitudePolicy;
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::FieldCache;
use crate::computed_field::field_core::{
    ComputedFieldCore, FieldContext, FieldCore, FieldDefinition, FieldKind,
    nonlinear_tree_order, source_names,
};
use crate::computed_field::field_derivative::FieldDerivative;
use crate::computed_field::field_module::{FieldId, FieldModule};
use crate::computed_field::finite_difference::evaluate_derivative_finite_difference;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Generalised cross product of `dimension - 1` vectors of `dimension` components.
///
/// 2D: rotation by +90 degrees, `(x, y) -> (-y, x)`.
/// 3D: the usual `a x b`.
/// 4D: the vector `r` with `r . x = det[x; a; b; c]` for every `x`, orthogonal to `a`, `b`, `c`.
pub fn cross_product(dimension: usize, vectors: &[DVector<f64>]) -> Result<DVector<f64>, FieldError> {
    if !(2..=4).contains(&dimension) {
        return Err(FieldError::InvalidDimension(dimension));
    }
    if vectors.len() + 1 != dimension {
        return Err(FieldError::InvalidSourceCount {
            expected: dimension - 1,
            found: vectors.len(),
        });
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(FieldError::ComponentCountMismatch {
            expected: dimension,
            found: v.len(),
        });
    }
    let result = match dimension {
        2 => DVector::from_vec(vec![-vectors[0][1], vectors[0][0]]),
        3 => {
            let a = Vector3::from_column_slice(vectors[0].as_slice());
            let b = Vector3::from_column_slice(vectors[1].as_slice());
            DVector::from_column_slice(a.cross(&b).as_slice())
        }
        _ => {
            // cofactor expansion along the first row of [x; a; b; c]
            let mut result = DVector::zeros(4);
            for i in 0..4 {
                let columns: Vec<usize> = (0..4).filter(|&c| c != i).collect();
                let minor = Matrix3::from_fn(|r, c| vectors[r][columns[c]]);
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                result[i] = sign * minor.determinant();
            }
            result
        }
    };
    Ok(result)
}

/// 1 / |v| honouring the zero-magnitude policy; None means "use an all-zero result"
fn inverse_magnitude(
    ctx: &FieldContext<'_>,
    magnitude: f64,
) -> Result<Option<f64>, FieldError> {
    if magnitude != 0.0 {
        return Ok(Some(1.0 / magnitude));
    }
    match ctx.module.settings().zero_magnitude_policy {
        ZeroMagnitudePolicy::Zero => {
            debug!("field '{}': zero magnitude, substituting zero", ctx.name);
            Ok(None)
        }
        ZeroMagnitudePolicy::Fail => {
            warn!("field '{}': zero magnitude", ctx.name);
            Err(FieldError::ZeroMagnitude(ctx.name.to_string()))
        }
    }
}

/// `w . column` for every column of a derivative tensor, as a one-row tensor
fn weighted_sum(weights: &DVector<f64>, tensor: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(1, tensor.ncols(), |_, t| weights.dot(&tensor.column(t)))
}

fn single_source_definition(
    module: &FieldModule,
    core: FieldCore,
    source: FieldId,
    number_of_components: Option<usize>,
) -> Result<FieldDefinition, FieldError> {
    let source_components = module.source_components(source)?;
    Ok(FieldDefinition {
        core,
        source_fields: vec![source],
        number_of_components: number_of_components.unwrap_or(source_components),
    })
}

////////////////////////////////////////////////////////////////
//  NORMALISE
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug, Default)]
pub struct Normalise;

impl Normalise {
    pub fn definition(module: &FieldModule, source: FieldId) -> Result<FieldDefinition, FieldError> {
        single_source_definition(module, Normalise.into(), source, None)
    }
}

impl ComputedFieldCore for Normalise {
    fn kind(&self) -> FieldKind {
        FieldKind::Normalise
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let v = ctx.evaluate_source(cache, 0)?;
        match inverse_magnitude(ctx, v.norm())? {
            Some(scale) => Ok(v * scale),
            None => Ok(DVector::zeros(v.len())),
        }
    }

    /// d(v/|v|) = dv/|v| - v (v . dv) / |v|^3
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        if derivative.total_order() > 1 {
            return evaluate_derivative_finite_difference(ctx, cache, derivative);
        }
        let v = ctx.evaluate_source(cache, 0)?;
        let dv = ctx.evaluate_source_derivative(cache, 0, derivative)?;
        let Some(scale) = inverse_magnitude(ctx, v.norm())? else {
            return Ok(ctx.zero_derivative(derivative));
        };
        let scale3 = scale * scale * scale;
        let mut result = ctx.zero_derivative(derivative);
        for (t, dv_t) in dv.column_iter().enumerate() {
            let v_dot_dv = v.dot(&dv_t);
            result.set_column(t, &(dv_t * scale - &v * (v_dot_dv * scale3)));
        }
        Ok(result)
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        nonlinear_tree_order(ctx, derivative)
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::Normalise(_))
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("field {}", source_names(ctx))
    }
}

////////////////////////////////////////////////////////////////
//  CROSS PRODUCT
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug)]
pub struct CrossProduct {
    dimension: usize,
}

impl CrossProduct {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// `dimension - 1` sources of `dimension` components each, dimension 2, 3 or 4
    pub fn definition(
        module: &FieldModule,
        dimension: usize,
        sources: &[FieldId],
    ) -> Result<FieldDefinition, FieldError> {
        if !(2..=4).contains(&dimension) {
            return Err(FieldError::InvalidDimension(dimension));
        }
        if sources.len() + 1 != dimension {
            return Err(FieldError::InvalidSourceCount {
                expected: dimension - 1,
                found: sources.len(),
            });
        }
        for &source in sources {
            let found = module.source_components(source)?;
            if found != dimension {
                return Err(FieldError::ComponentCountMismatch {
                    expected: dimension,
                    found,
                });
            }
        }
        Ok(FieldDefinition {
            core: CrossProduct { dimension }.into(),
            source_fields: sources.to_vec(),
            number_of_components: dimension,
        })
    }

    fn source_values(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<Vec<DVector<f64>>, FieldError> {
        (0..ctx.source_fields.len())
            .map(|i| ctx.evaluate_source(cache, i))
            .collect()
    }
}

impl ComputedFieldCore for CrossProduct {
    fn kind(&self) -> FieldKind {
        FieldKind::CrossProduct
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let values = self.source_values(ctx, cache)?;
        cross_product(self.dimension, &values)
    }

    /// Multilinear product rule: sum over operands of the cross product with that operand
    /// replaced by its derivative
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        if derivative.total_order() > 1 {
            return evaluate_derivative_finite_difference(ctx, cache, derivative);
        }
        let values = self.source_values(ctx, cache)?;
        let mut derivatives = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            if ctx.source_tree_order(i, derivative) == 0 {
                derivatives.push(None);
            } else {
                derivatives.push(Some(ctx.evaluate_source_derivative(cache, i, derivative)?));
            }
        }
        let mut result = ctx.zero_derivative(derivative);
        for t in 0..derivative.term_count() {
            let mut column = DVector::zeros(self.dimension);
            for (i, source_derivative) in derivatives.iter().enumerate() {
                if let Some(source_derivative) = source_derivative {
                    let mut operands = values.clone();
                    operands[i] = source_derivative.column(t).clone_owned();
                    column += cross_product(self.dimension, &operands)?;
                }
            }
            result.set_column(t, &column);
        }
        Ok(result)
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        (0..ctx.source_fields.len())
            .map(|i| ctx.source_tree_order(i, derivative))
            .sum::<usize>()
            .min(derivative.total_order())
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::CrossProduct(cross) if cross.dimension == self.dimension)
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("dimension {} fields {}", self.dimension, source_names(ctx))
    }

    fn list_details(&self, _ctx: &FieldContext<'_>) -> Vec<(String, String)> {
        vec![("Dimension".to_string(), self.dimension.to_string())]
    }
}

////////////////////////////////////////////////////////////////
//  DOT PRODUCT
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug, Default)]
pub struct DotProduct;

impl DotProduct {
    pub fn definition(
        module: &FieldModule,
        source1: FieldId,
        source2: FieldId,
    ) -> Result<FieldDefinition, FieldError> {
        let components1 = module.source_components(source1)?;
        let components2 = module.source_components(source2)?;
        if components1 != components2 {
            return Err(FieldError::ComponentCountMismatch {
                expected: components1,
                found: components2,
            });
        }
        Ok(FieldDefinition {
            core: DotProduct.into(),
            source_fields: vec![source1, source2],
            number_of_components: 1,
        })
    }
}

impl ComputedFieldCore for DotProduct {
    fn kind(&self) -> FieldKind {
        FieldKind::DotProduct
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let a = ctx.evaluate_source(cache, 0)?;
        let b = ctx.evaluate_source(cache, 1)?;
        Ok(DVector::from_element(1, a.dot(&b)))
    }

    /// Product rule, decided by the tree orders of the two factors:
    /// 1. a constant factor: const . d(other), zero if both are constant;
    /// 2. first derivatives: a . db + b . da;
    /// 3. tree orders summing below the requested order: zero;
    /// 4. pure second derivatives: symmetric bilinear sum of first derivatives plus
    ///    const . d2(other) for factors that are non-linear;
    /// 5. otherwise finite differences.
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        let order = derivative.total_order();
        let tree_order1 = ctx.source_tree_order(0, derivative);
        let tree_order2 = ctx.source_tree_order(1, derivative);

        if tree_order1 == 0 || tree_order2 == 0 {
            if tree_order1 == 0 && tree_order2 == 0 {
                return Ok(ctx.zero_derivative(derivative));
            }
            let (constant_index, other_index) = if tree_order1 == 0 { (0, 1) } else { (1, 0) };
            let constant = ctx.evaluate_source(cache, constant_index)?;
            let other = ctx.evaluate_source_derivative(cache, other_index, derivative)?;
            return Ok(weighted_sum(&constant, &other));
        }

        if order == 1 {
            let a = ctx.evaluate_source(cache, 0)?;
            let b = ctx.evaluate_source(cache, 1)?;
            let da = ctx.evaluate_source_derivative(cache, 0, derivative)?;
            let db = ctx.evaluate_source_derivative(cache, 1, derivative)?;
            return Ok(weighted_sum(&a, &db) + weighted_sum(&b, &da));
        }

        if tree_order1 + tree_order2 < order {
            return Ok(ctx.zero_derivative(derivative));
        }

        if order == 2 && !derivative.is_mixed() {
            if let Some(lower) = derivative.lower_derivative() {
                let da = ctx.evaluate_source_derivative(cache, 0, &lower)?;
                let db = ctx.evaluate_source_derivative(cache, 1, &lower)?;
                let lower_terms = lower.term_count();
                let mut result = ctx.zero_derivative(derivative);
                for i in 0..lower_terms {
                    for j in 0..lower_terms {
                        result[(0, i * lower_terms + j)] =
                            da.column(i).dot(&db.column(j)) + da.column(j).dot(&db.column(i));
                    }
                }
                if tree_order1 >= 2 {
                    let b = ctx.evaluate_source(cache, 1)?;
                    let d2a = ctx.evaluate_source_derivative(cache, 0, derivative)?;
                    result += weighted_sum(&b, &d2a);
                }
                if tree_order2 >= 2 {
                    let a = ctx.evaluate_source(cache, 0)?;
                    let d2b = ctx.evaluate_source_derivative(cache, 1, derivative)?;
                    result += weighted_sum(&a, &d2b);
                }
                return Ok(result);
            }
        }

        evaluate_derivative_finite_difference(ctx, cache, derivative)
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        (ctx.source_tree_order(0, derivative) + ctx.source_tree_order(1, derivative))
            .min(derivative.total_order())
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::DotProduct(_))
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("fields {}", source_names(ctx))
    }
}

////////////////////////////////////////////////////////////////
//  MAGNITUDE
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug, Default)]
pub struct Magnitude;

impl Magnitude {
    pub fn definition(module: &FieldModule, source: FieldId) -> Result<FieldDefinition, FieldError> {
        single_source_definition(module, Magnitude.into(), source, Some(1))
    }
}

impl ComputedFieldCore for Magnitude {
    fn kind(&self) -> FieldKind {
        FieldKind::Magnitude
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let a = ctx.evaluate_source(cache, 0)?;
        Ok(DVector::from_element(1, a.norm()))
    }

    /// d|a| = (a . da) / |a|
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        if derivative.total_order() > 1 {
            return evaluate_derivative_finite_difference(ctx, cache, derivative);
        }
        let a = ctx.evaluate_source(cache, 0)?;
        let da = ctx.evaluate_source_derivative(cache, 0, derivative)?;
        match inverse_magnitude(ctx, a.norm())? {
            Some(scale) => Ok(weighted_sum(&a, &da) * scale),
            None => Ok(ctx.zero_derivative(derivative)),
        }
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        nonlinear_tree_order(ctx, derivative)
    }

    /// Rescale the source vector uniformly so its magnitude becomes the assigned value
    fn assign(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        values: &DVector<f64>,
    ) -> Result<(), FieldError> {
        let a = ctx.evaluate_source(cache, 0)?;
        let magnitude = a.norm();
        if magnitude == 0.0 {
            warn!(
                "cannot assign magnitude {} to field '{}': source '{}' has zero magnitude",
                values[0],
                ctx.name,
                ctx.source_name(0)
            );
            return Err(FieldError::ZeroMagnitude(ctx.source_name(0)));
        }
        let scaled = a * (values[0] / magnitude);
        ctx.module.assign_cached(cache, ctx.source(0), &scaled)
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::Magnitude(_))
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("field {}", source_names(ctx))
    }
}

////////////////////////////////////////////////////////////////
//  SUM COMPONENTS
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug, Default)]
pub struct SumComponents;

impl SumComponents {
    pub fn definition(module: &FieldModule, source: FieldId) -> Result<FieldDefinition, FieldError> {
        single_source_definition(module, SumComponents.into(), source, Some(1))
    }
}

impl ComputedFieldCore for SumComponents {
    fn kind(&self) -> FieldKind {
        FieldKind::SumComponents
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let a = ctx.evaluate_source(cache, 0)?;
        Ok(DVector::from_element(1, a.sum()))
    }

    // linear: exact at every order
    fn evaluate_derivative(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        if ctx.source_tree_order(0, derivative) < derivative.total_order() {
            return Ok(ctx.zero_derivative(derivative));
        }
        let da = ctx.evaluate_source_derivative(cache, 0, derivative)?;
        Ok(DMatrix::from_fn(1, da.ncols(), |_, t| da.column(t).sum()))
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        ctx.source_tree_order(0, derivative)
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::SumComponents(_))
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("field {}", source_names(ctx))
    }
}

////////////////////////////////////////////////////////////////
//  CUBIC TEXTURE COORDINATES
////////////////////////////////////////////////////////////////
/// Projection onto the face of the unit cube hit by the source direction: the components
/// other than the dominant one divided by its absolute value, followed by that absolute
/// value. Not differentiable where the dominant component changes; derivatives are always
/// finite differences.
#[derive(Clone, Debug, Default)]
pub struct CubicTextureCoordinates;

impl CubicTextureCoordinates {
    pub fn definition(module: &FieldModule, source: FieldId) -> Result<FieldDefinition, FieldError> {
        single_source_definition(module, CubicTextureCoordinates.into(), source, None)
    }
}

impl ComputedFieldCore for CubicTextureCoordinates {
    fn kind(&self) -> FieldKind {
        FieldKind::CubicTextureCoordinates
    }

    fn evaluate(
        &self,
        ctx: &FieldContext<'_>,
        cache: &mut FieldCache,
    ) -> Result<DVector<f64>, FieldError> {
        let v = ctx.evaluate_source(cache, 0)?;
        // first component of largest absolute value
        let (dominant, magnitude) = v
            .iter()
            .map(|x| x.abs())
            .enumerate()
            .fold((0, 0.0), |(best, best_value), (i, value)| {
                if value > best_value { (i, value) } else { (best, best_value) }
            });
        let Some(scale) = inverse_magnitude(ctx, magnitude)? else {
            return Ok(DVector::zeros(v.len()));
        };
        let mut result = DVector::zeros(v.len());
        let mut j = 0;
        for (i, &x) in v.iter().enumerate() {
            if i != dominant {
                result[j] = x * scale;
                j += 1;
            }
        }
        result[v.len() - 1] = magnitude;
        Ok(result)
    }

    fn derivative_tree_order(&self, ctx: &FieldContext<'_>, derivative: &FieldDerivative) -> usize {
        nonlinear_tree_order(ctx, derivative)
    }

    fn compare(&self, other: &FieldCore) -> bool {
        matches!(other, FieldCore::CubicTextureCoordinates(_))
    }

    fn command_arguments(&self, ctx: &FieldContext<'_>) -> String {
        format!("field {}", source_names(ctx))
    }
}
