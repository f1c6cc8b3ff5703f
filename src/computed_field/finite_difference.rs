//! Finite-difference derivatives for operators without closed-form rules.
//!
//! A derivative of order n is built from the derivative of order n - 1 (or from the values
//! for n = 1) by differencing along the variable that derivative lacks:
//!
//! `d[lower_term * count + k] = (lower(x + h e_k) - lower(x - h e_k)) / 2h`
//!
//! Perturbed evaluations run on the cache's scratch cache so the values memoized at the
//! caller's location stay untouched. Where only one side of the stencil can be evaluated (a
//! boundary of the region the field is defined on) a one-sided difference against the
//! unperturbed value is used.
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::{FieldCache, Location, MeshLocation};
use crate::computed_field::field_core::FieldContext;
use crate::computed_field::field_derivative::{DerivativeVariable, FieldDerivative};
use log::debug;
use nalgebra::{DMatrix, DVector};

/// The value one order below `derivative`, as components x lower terms
fn lower_value(
    ctx: &FieldContext<'_>,
    cache: &mut FieldCache,
    lower: Option<&FieldDerivative>,
) -> Result<DMatrix<f64>, FieldError> {
    match lower {
        Some(lower) => ctx.module.evaluate_derivative_cached(cache, ctx.field, lower),
        None => {
            let values = ctx.module.evaluate_cached(cache, ctx.field)?;
            Ok(DMatrix::from_column_slice(values.len(), 1, values.as_slice()))
        }
    }
}

/// Location and parameters moved by `step` along variable `k` of kind `variable`
fn perturbed_state(
    location: &Location,
    parameters: &DVector<f64>,
    variable: DerivativeVariable,
    k: usize,
    step: f64,
) -> (Location, DVector<f64>) {
    match (variable, location) {
        (DerivativeVariable::Mesh, Location::Mesh(mesh_location)) => {
            let mut xi = mesh_location.xi.clone();
            xi[k] += step;
            (
                Location::Mesh(MeshLocation {
                    element: mesh_location.element,
                    xi,
                }),
                parameters.clone(),
            )
        }
        _ => {
            let mut parameters = parameters.clone();
            parameters[k] += step;
            (location.clone(), parameters)
        }
    }
}

fn check_applicable(
    location: &Location,
    parameters: &DVector<f64>,
    variable: DerivativeVariable,
    count: usize,
) -> Result<(), FieldError> {
    match variable {
        DerivativeVariable::Mesh => match location {
            Location::Mesh(mesh_location) if mesh_location.xi.len() == count => Ok(()),
            _ => Err(FieldError::DerivativeNotApplicable(format!(
                "mesh derivative needs a mesh location of dimension {}",
                count
            ))),
        },
        DerivativeVariable::Parameter if parameters.len() == count => Ok(()),
        DerivativeVariable::Parameter => Err(FieldError::DerivativeNotApplicable(format!(
            "parameter derivative needs {} cache parameters, cache has {}",
            count,
            parameters.len()
        ))),
    }
}

pub(crate) fn evaluate_derivative_finite_difference(
    ctx: &FieldContext<'_>,
    cache: &mut FieldCache,
    derivative: &FieldDerivative,
) -> Result<DMatrix<f64>, FieldError> {
    let location = cache
        .location()
        .cloned()
        .ok_or(FieldError::LocationNotSet)?;
    let parameters = cache.parameters().clone();
    let variable = derivative.last_variable();
    let count = derivative.last_variable_count();
    check_applicable(&location, &parameters, variable, count)?;

    let lower = derivative.lower_derivative();
    let lower_terms = lower.map(|l| l.term_count()).unwrap_or(1);
    let step = ctx.module.settings().finite_difference_step;
    debug!(
        "finite difference {:?} of field '{}' with step {}",
        derivative, ctx.name, step
    );

    let mut result = ctx.zero_derivative(derivative);
    let mut centre: Option<DMatrix<f64>> = None;
    let mut extra = cache.take_extra_cache();
    let outcome = (|| -> Result<(), FieldError> {
        for k in 0..count {
            let (plus_location, plus_parameters) =
                perturbed_state(&location, &parameters, variable, k, step);
            extra.set_state(plus_location, plus_parameters);
            let plus = lower_value(ctx, &mut extra, lower.as_ref());
            let (minus_location, minus_parameters) =
                perturbed_state(&location, &parameters, variable, k, -step);
            extra.set_state(minus_location, minus_parameters);
            let minus = lower_value(ctx, &mut extra, lower.as_ref());

            let difference = match (plus, minus) {
                (Ok(plus), Ok(minus)) => (plus - minus) / (2.0 * step),
                (Ok(plus), Err(_)) => {
                    debug!("field '{}': one-sided forward difference", ctx.name);
                    let centre_value = match centre.take() {
                        Some(value) => value,
                        None => lower_value(ctx, cache, lower.as_ref())?,
                    };
                    let difference = (plus - &centre_value) / step;
                    centre = Some(centre_value);
                    difference
                }
                (Err(_), Ok(minus)) => {
                    debug!("field '{}': one-sided backward difference", ctx.name);
                    let centre_value = match centre.take() {
                        Some(value) => value,
                        None => lower_value(ctx, cache, lower.as_ref())?,
                    };
                    let difference = (&centre_value - minus) / step;
                    centre = Some(centre_value);
                    difference
                }
                (Err(error), Err(_)) => return Err(error),
            };
            for lower_term in 0..lower_terms {
                result.set_column(lower_term * count + k, &difference.column(lower_term));
            }
        }
        Ok(())
    })();
    cache.restore_extra_cache(extra);
    outcome.map(|_| result)
}
