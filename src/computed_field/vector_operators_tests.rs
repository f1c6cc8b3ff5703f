use crate::Utils::settings::{EvaluationSettings, ZeroMagnitudePolicy};
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::{ElementId, EvaluationPoint, FieldCache, NodeId};
use crate::computed_field::field_core::{ComputedFieldCore, FieldContext};
use crate::computed_field::field_derivative::FieldDerivative;
use crate::computed_field::field_module::{FieldId, FieldModule};
use crate::computed_field::source_fields::{
    Constant, FieldProvider, Monomial, NodalField, PolynomialField,
};
use crate::computed_field::value_cache::CacheState;
use crate::computed_field::vector_operators::DotProduct;
use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn m(monomials: &[(f64, &[u32])]) -> Vec<Monomial> {
    monomials
        .iter()
        .map(|(coefficient, powers)| Monomial::new(*coefficient, powers, &[]))
        .collect()
}

/// polynomial field over a mesh of `dimension`, one monomial list per component
fn polynomial(module: &mut FieldModule, dimension: usize, components: Vec<Vec<Monomial>>) -> FieldId {
    let mut field = PolynomialField::new(dimension, 0);
    for monomials in components {
        field = field.with_component(monomials).unwrap();
    }
    module.create_external(Arc::new(field)).unwrap()
}

fn cache_at(module: &FieldModule, xi: &[f64]) -> FieldCache {
    let mut cache = module.create_field_cache();
    cache.set_mesh_location(ElementId(1), xi);
    cache
}

fn values(module: &FieldModule, cache: &mut FieldCache, field: FieldId) -> Vec<f64> {
    module.evaluate(cache, field).unwrap().as_slice().to_vec()
}

fn derivative(
    module: &FieldModule,
    cache: &mut FieldCache,
    field: FieldId,
    derivative: &FieldDerivative,
) -> DMatrix<f64> {
    module.evaluate_derivative(cache, field, derivative).unwrap().values
}

/// central difference of the values of `field` along xi[k]
fn central_difference(module: &FieldModule, field: FieldId, xi: &[f64], k: usize, h: f64) -> DVector<f64> {
    let mut plus = xi.to_vec();
    plus[k] += h;
    let mut minus = xi.to_vec();
    minus[k] -= h;
    let f_plus = module.evaluate(&mut cache_at(module, &plus), field).unwrap();
    let f_minus = module.evaluate(&mut cache_at(module, &minus), field).unwrap();
    (f_plus - f_minus) / (2.0 * h)
}

#[derive(Debug, Default)]
struct CountingProvider {
    calls: AtomicUsize,
}

impl FieldProvider for CountingProvider {
    fn number_of_components(&self) -> usize {
        3
    }

    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let xi = point.xi()?;
        Some(DVector::from_vec(vec![xi[0], 1.0, 2.0]))
    }
}

/// x^2, defined only for x >= 0, without analytic derivatives
#[derive(Debug)]
struct HalfLine;

impl FieldProvider for HalfLine {
    fn number_of_components(&self) -> usize {
        1
    }

    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>> {
        let x = point.xi()?[0];
        (x >= 0.0).then(|| DVector::from_element(1, x * x))
    }
}

////////////////////////////////////////////////////////////////
//  SCENARIO
////////////////////////////////////////////////////////////////
#[test]
fn test_observed_scenario() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[2.0, 0.0, 0.0]).unwrap();
    let b = module.create_constant(&[0.0, 1.5, 0.0]).unwrap();
    let c = module.create_constant(&[2.0, 4.0, 6.0]).unwrap();
    let d = module.create_constant(&[1.0, 1.0]).unwrap();
    let cross3 = module.create_cross_product(3, &[a, b]).unwrap();
    let cross2 = module.create_cross_product(2, &[d]).unwrap();
    let dot = module.create_dot_product(a, b).unwrap();
    let sum = module.create_sum_components(c).unwrap();
    let normalised = module.create_normalise(c).unwrap();
    let parallel = module.create_cross_product(3, &[normalised, c]).unwrap();

    let mut cache = module.create_field_cache();
    assert_eq!(values(&module, &mut cache, cross3), vec![0.0, 0.0, 3.0]);
    assert_eq!(values(&module, &mut cache, cross2), vec![-1.0, 1.0]);
    assert_eq!(values(&module, &mut cache, dot), vec![0.0]);
    assert_eq!(values(&module, &mut cache, sum), vec![12.0]);
    let n = module.evaluate(&mut cache, normalised).unwrap();
    assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-14);
    for x in values(&module, &mut cache, parallel) {
        assert_relative_eq!(x, 0.0, epsilon = 1e-14);
    }
}

////////////////////////////////////////////////////////////////
//  CONSTRUCTION
////////////////////////////////////////////////////////////////
#[test]
fn test_construction_validation() {
    let mut module = FieldModule::new();
    let v3 = module.create_constant(&[1.0, 2.0, 3.0]).unwrap();
    let v2 = module.create_constant(&[1.0, 2.0]).unwrap();
    let before = module.number_of_fields();
    assert_eq!(
        module.create_cross_product(5, &[v3, v3, v3, v3]).unwrap_err(),
        FieldError::InvalidDimension(5)
    );
    assert_eq!(
        module.create_cross_product(3, &[v3, v2]).unwrap_err(),
        FieldError::ComponentCountMismatch {
            expected: 3,
            found: 2
        }
    );
    assert_eq!(
        module.create_cross_product(3, &[v3]).unwrap_err(),
        FieldError::InvalidSourceCount {
            expected: 2,
            found: 1
        }
    );
    assert!(matches!(
        module.create_dot_product(v3, v2).unwrap_err(),
        FieldError::ComponentCountMismatch { .. }
    ));
    assert!(module.create_constant(&[]).is_err());

    let removed = module.create_constant(&[1.0, 0.0, 0.0]).unwrap();
    module.remove_field(removed).unwrap();
    assert_eq!(
        module.create_normalise(removed).unwrap_err(),
        FieldError::MissingSourceField
    );
    let mut other = FieldModule::new();
    let foreign = other.create_constant(&[1.0, 0.0, 0.0]).unwrap();
    assert_eq!(
        module.create_magnitude(foreign).unwrap_err(),
        FieldError::ForeignField
    );
    // no partially built fields
    assert_eq!(module.number_of_fields(), before);

    assert!(matches!(
        module.create_cross_product(4, &[v3, v3, v3]).unwrap_err(),
        FieldError::ComponentCountMismatch { .. }
    ));
    assert_eq!(module.number_of_components(v3).unwrap(), 3);
    assert_eq!(module.number_of_source_fields(v3).unwrap(), 0);
}

////////////////////////////////////////////////////////////////
//  CROSS PRODUCT
////////////////////////////////////////////////////////////////
#[test]
fn test_cross_product_properties() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut module = FieldModule::new();
    let mut cache = module.create_field_cache();
    for _ in 0..20 {
        let a: Vec<f64> = (0..3).map(|_| rng.random_range(-5.0..5.0)).collect();
        let b: Vec<f64> = (0..3).map(|_| rng.random_range(-5.0..5.0)).collect();
        let fa = module.create_constant(&a).unwrap();
        let fb = module.create_constant(&b).unwrap();
        let ab = module.create_cross_product(3, &[fa, fb]).unwrap();
        let ba = module.create_cross_product(3, &[fb, fa]).unwrap();
        let c = module.evaluate(&mut cache, ab).unwrap();
        let c_reversed = module.evaluate(&mut cache, ba).unwrap();
        let a = DVector::from_vec(a);
        let b = DVector::from_vec(b);
        assert_relative_eq!(c.dot(&a), 0.0, epsilon = 1e-10);
        assert_relative_eq!(c.dot(&b), 0.0, epsilon = 1e-10);
        assert_relative_eq!(c, -c_reversed, epsilon = 1e-12);
        // |a x b| = |a||b| sin(theta)
        let cos = a.dot(&b) / (a.norm() * b.norm());
        let sin = (1.0 - cos * cos).max(0.0).sqrt();
        assert_relative_eq!(c.norm(), a.norm() * b.norm() * sin, epsilon = 1e-9);
    }
}

#[test]
fn test_cross_product_first_derivative() {
    let mut module = FieldModule::new();
    // a = (x, y, 0), b = (0, 0, 2)
    let a = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[1])]), m(&[(1.0, &[0, 1])]), vec![]],
    );
    let b = module.create_constant(&[0.0, 0.0, 2.0]).unwrap();
    let ab = module.create_cross_product(3, &[a, b]).unwrap();
    let mut cache = cache_at(&module, &[0.3, 0.7]);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let result = derivative(&module, &mut cache, ab, &d1);
    assert_relative_eq!(result, DMatrix::from_row_slice(3, 2, &[0.0, 2.0, -2.0, 0.0, 0.0, 0.0]));

    // both operands varying: a = (x, y, 0), b = (y, 1, x^2)
    let b = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[0, 1])]), m(&[(1.0, &[])]), m(&[(1.0, &[2])])],
    );
    let ab = module.create_cross_product(3, &[a, b]).unwrap();
    let xi = [0.3, 0.7];
    let mut cache = cache_at(&module, &xi);
    let result = derivative(&module, &mut cache, ab, &d1);
    for k in 0..2 {
        let numeric = central_difference(&module, ab, &xi, k, 1e-6);
        assert_relative_eq!(result.column(k).clone_owned(), numeric, epsilon = 1e-8);
    }

    let mut flat = vec![0.0; 6];
    module
        .evaluate_derivative_real(&mut cache, ab, &d1, &mut flat)
        .unwrap();
    assert_eq!(flat[0], result[(0, 0)]);
    assert_eq!(flat[1], result[(0, 1)]);
    assert_eq!(flat[2], result[(1, 0)]);
}

#[test]
fn test_cross_product_4d_derivative() {
    let mut module = FieldModule::new();
    // a = (x, 0, 0, 1), b = (0, 1, 0, 0), c = (0, 0, 1, y)
    let a = polynomial(&mut module, 2, vec![m(&[(1.0, &[1])]), vec![], vec![], m(&[(1.0, &[])])]);
    let b = module.create_constant(&[0.0, 1.0, 0.0, 0.0]).unwrap();
    let c = polynomial(
        &mut module,
        2,
        vec![vec![], vec![], m(&[(1.0, &[])]), m(&[(1.0, &[0, 1])])],
    );
    let cross = module.create_cross_product(4, &[a, b, c]).unwrap();
    let xi = [0.4, -0.6];
    let mut cache = cache_at(&module, &xi);
    let value = module.evaluate(&mut cache, cross).unwrap();
    for source in [a, b, c] {
        let v = module.evaluate(&mut cache, source).unwrap();
        assert_relative_eq!(value.dot(&v), 0.0, epsilon = 1e-12);
    }
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let result = derivative(&module, &mut cache, cross, &d1);
    for k in 0..2 {
        let numeric = central_difference(&module, cross, &xi, k, 1e-6);
        assert_relative_eq!(result.column(k).clone_owned(), numeric, epsilon = 1e-8);
    }
}

////////////////////////////////////////////////////////////////
//  NORMALISE
////////////////////////////////////////////////////////////////
#[test]
fn test_normalise_unit_length_and_derivative() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut module = FieldModule::new();
    let mut cache = module.create_field_cache();
    for _ in 0..10 {
        let v: Vec<f64> = (0..4).map(|_| rng.random_range(-3.0..3.0)).collect();
        let field = module.create_constant(&v).unwrap();
        let n = module.create_normalise(field).unwrap();
        let result = module.evaluate(&mut cache, n).unwrap();
        assert_relative_eq!(result.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(result * DVector::from_vec(v.clone()).norm(), DVector::from_vec(v), epsilon = 1e-12);
    }

    // v = (x, y, 1)
    let v = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[1])]), m(&[(1.0, &[0, 1])]), m(&[(1.0, &[])])],
    );
    let n = module.create_normalise(v).unwrap();
    let xi = [0.3, 0.4];
    let mut cache = cache_at(&module, &xi);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let result = derivative(&module, &mut cache, n, &d1);
    // d/dx (v/|v|) = e_x/|v| - v x/|v|^3
    let length = (0.3f64 * 0.3 + 0.4 * 0.4 + 1.0).sqrt();
    assert_relative_eq!(result[(0, 0)], 1.0 / length - 0.3 * 0.3 / length.powi(3), epsilon = 1e-12);
    assert_relative_eq!(result[(1, 0)], -0.4 * 0.3 / length.powi(3), epsilon = 1e-12);
    for k in 0..2 {
        let numeric = central_difference(&module, n, &xi, k, 1e-6);
        assert_relative_eq!(result.column(k).clone_owned(), numeric, epsilon = 1e-8);
    }
}

#[test]
fn test_normalise_zero_magnitude_policies() {
    let mut module = FieldModule::new();
    let zero = module.create_constant(&[0.0, 0.0, 0.0]).unwrap();
    let n = module.create_normalise(zero).unwrap();
    // v = (x, 0) vanishes at x = 0
    let v = polynomial(&mut module, 1, vec![m(&[(1.0, &[1])]), vec![]]);
    let nv = module.create_normalise(v).unwrap();
    let mut cache = cache_at(&module, &[0.0]);
    assert_eq!(values(&module, &mut cache, n), vec![0.0, 0.0, 0.0]);
    assert!(values(&module, &mut cache, nv).iter().all(|x| *x == 0.0));
    let d1 = FieldDerivative::mesh(1, 1).unwrap();
    assert_eq!(derivative(&module, &mut cache, nv, &d1), DMatrix::zeros(2, 1));

    module.set_settings(EvaluationSettings::default().with_zero_magnitude_policy(ZeroMagnitudePolicy::Fail));
    assert_eq!(
        module.evaluate(&mut cache, n).unwrap_err(),
        FieldError::ZeroMagnitude(module.get_field_name(n).unwrap())
    );
    assert!(matches!(
        module.evaluate_derivative(&mut cache, nv, &d1).unwrap_err(),
        FieldError::ZeroMagnitude(_)
    ));
    // failures leave nothing behind
    assert_eq!(cache.value_cache_state(n), CacheState::Unevaluated);
}

////////////////////////////////////////////////////////////////
//  DOT PRODUCT
////////////////////////////////////////////////////////////////
#[test]
fn test_dot_product_both_constant() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[1.0, 2.0, 3.0]).unwrap();
    let b = module.create_constant(&[4.0, 5.0, 6.0]).unwrap();
    let dot = module.create_dot_product(a, b).unwrap();
    let mut cache = cache_at(&module, &[0.5, 2.0]);
    assert_eq!(values(&module, &mut cache, dot), vec![32.0]);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    assert_eq!(module.derivative_tree_order(dot, &d1).unwrap(), 0);
    assert_eq!(derivative(&module, &mut cache, dot, &d1), DMatrix::zeros(1, 2));
}

#[test]
fn test_dot_product_one_constant() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[1.0, 2.0, 3.0]).unwrap();
    // b = (x^2, xy, y)
    let b = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[2])]), m(&[(1.0, &[1, 1])]), m(&[(1.0, &[0, 1])])],
    );
    let mut cache = cache_at(&module, &[0.5, 2.0]);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let d2 = FieldDerivative::mesh(2, 2).unwrap();
    for dot in [
        module.create_dot_product(a, b).unwrap(),
        module.create_dot_product(b, a).unwrap(),
    ] {
        // d/dx = 2x + 2y, d/dy = 2x + 3
        assert_relative_eq!(
            derivative(&module, &mut cache, dot, &d1),
            DMatrix::from_row_slice(1, 2, &[5.0, 4.0])
        );
        assert_relative_eq!(
            derivative(&module, &mut cache, dot, &d2),
            DMatrix::from_row_slice(1, 4, &[2.0, 2.0, 2.0, 0.0])
        );
    }
}

#[test]
fn test_dot_product_first_and_second_order() {
    let mut module = FieldModule::new();
    // a = (x, y, 0), b = (y, x^2, 1); a.b = xy + x^2 y
    let a = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[1])]), m(&[(1.0, &[0, 1])]), vec![]],
    );
    let b = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[0, 1])]), m(&[(1.0, &[2])]), m(&[(1.0, &[])])],
    );
    let mut cache = cache_at(&module, &[0.5, 2.0]);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let d2 = FieldDerivative::mesh(2, 2).unwrap();
    for dot in [
        module.create_dot_product(a, b).unwrap(),
        module.create_dot_product(b, a).unwrap(),
    ] {
        assert_eq!(values(&module, &mut cache, dot), vec![1.0 + 0.5]);
        assert_relative_eq!(
            derivative(&module, &mut cache, dot, &d1),
            DMatrix::from_row_slice(1, 2, &[4.0, 0.75]),
            epsilon = 1e-14
        );
        // [2y, 1 + 2x, 1 + 2x, 0]
        assert_relative_eq!(
            derivative(&module, &mut cache, dot, &d2),
            DMatrix::from_row_slice(1, 4, &[4.0, 2.0, 2.0, 0.0]),
            epsilon = 1e-14
        );
    }
}

#[test]
fn test_dot_product_vanishing_higher_order() {
    let mut module = FieldModule::new();
    // two linear factors: every third derivative of the product vanishes
    let a = polynomial(&mut module, 2, vec![m(&[(2.0, &[1])]), m(&[(1.0, &[0, 1])])]);
    let b = polynomial(&mut module, 2, vec![m(&[(1.0, &[0, 1])]), m(&[(3.0, &[1])])]);
    let dot = module.create_dot_product(a, b).unwrap();
    let mut cache = cache_at(&module, &[0.5, 2.0]);
    let d3 = FieldDerivative::mesh(2, 3).unwrap();
    assert_eq!(derivative(&module, &mut cache, dot, &d3), DMatrix::zeros(1, 8));

    // the kernel reaches the same conclusion on its own
    let definition = module.definition(dot).unwrap();
    let ctx = FieldContext {
        module: &module,
        field: dot,
        name: "dot",
        source_fields: &definition.source_fields,
        number_of_components: 1,
    };
    let direct = DotProduct.evaluate_derivative(&ctx, &mut cache, &d3).unwrap();
    assert_eq!(direct, DMatrix::zeros(1, 8));
}

#[test]
fn test_dot_product_finite_difference_fallback() {
    let mut module = FieldModule::new();
    // mixed: a = (x p0, 1), b = (y, x); d/dp (a.b) = xy
    let a = module
        .create_external(Arc::new(
            PolynomialField::new(2, 1)
                .with_component(vec![Monomial::new(1.0, &[1], &[1])])
                .unwrap()
                .with_component(vec![Monomial::constant(1.0)])
                .unwrap(),
        ))
        .unwrap();
    let b = module
        .create_external(Arc::new(
            PolynomialField::new(2, 1)
                .with_component(vec![Monomial::new(1.0, &[0, 1], &[])])
                .unwrap()
                .with_component(vec![Monomial::new(1.0, &[1], &[])])
                .unwrap(),
        ))
        .unwrap();
    let dot = module.create_dot_product(a, b).unwrap();
    let mut cache = cache_at(&module, &[0.5, 2.0]);
    cache.set_parameters(&[3.0]);
    let mixed = FieldDerivative::mixed(2, 1, 1, 1).unwrap();
    assert!(mixed.is_mixed());
    let result = derivative(&module, &mut cache, dot, &mixed);
    assert_relative_eq!(result, DMatrix::from_row_slice(1, 2, &[2.0, 0.5]), epsilon = 1e-6);

    // third order: a = (x^2, 0), b = (x, 0); a.b = x^3
    let a = polynomial(&mut module, 1, vec![m(&[(1.0, &[2])]), vec![]]);
    let b = polynomial(&mut module, 1, vec![m(&[(1.0, &[1])]), vec![]]);
    let dot = module.create_dot_product(a, b).unwrap();
    let mut cache = cache_at(&module, &[0.7]);
    let d3 = FieldDerivative::mesh(1, 3).unwrap();
    assert_relative_eq!(derivative(&module, &mut cache, dot, &d3)[(0, 0)], 6.0, epsilon = 1e-6);
}

////////////////////////////////////////////////////////////////
//  MAGNITUDE
////////////////////////////////////////////////////////////////
#[test]
fn test_magnitude_value_and_derivative() {
    let mut module = FieldModule::new();
    let a = polynomial(&mut module, 2, vec![m(&[(1.0, &[1])]), m(&[(1.0, &[0, 1])])]);
    let magnitude = module.create_magnitude(a).unwrap();
    let mut cache = cache_at(&module, &[3.0, 4.0]);
    assert_eq!(values(&module, &mut cache, magnitude), vec![5.0]);
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    assert_relative_eq!(
        derivative(&module, &mut cache, magnitude, &d1),
        DMatrix::from_row_slice(1, 2, &[0.6, 0.8]),
        epsilon = 1e-14
    );
    // second derivative via finite differences: d2|a|/dx2 = y^2 / |a|^3
    let d2 = FieldDerivative::mesh(2, 2).unwrap();
    assert_relative_eq!(
        derivative(&module, &mut cache, magnitude, &d2)[(0, 0)],
        16.0 / 125.0,
        epsilon = 1e-6
    );
}

#[test]
fn test_magnitude_assign_round_trip() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[3.0, 4.0]).unwrap();
    let magnitude = module.create_magnitude(a).unwrap();
    let mut cache = module.create_field_cache();
    assert_eq!(values(&module, &mut cache, magnitude), vec![5.0]);
    module.assign_real(&mut cache, magnitude, &[10.0]).unwrap();
    assert_relative_eq!(values(&module, &mut cache, magnitude)[0], 10.0);
    let rescaled = module.evaluate(&mut cache, a).unwrap();
    assert_relative_eq!(rescaled, DVector::from_vec(vec![6.0, 8.0]));
    assert_eq!(
        module.assign_real(&mut cache, magnitude, &[1.0, 2.0]).unwrap_err(),
        FieldError::ComponentCountMismatch {
            expected: 1,
            found: 2
        }
    );
}

#[test]
fn test_magnitude_assign_at_node() {
    let mut module = FieldModule::new();
    let nodal = Arc::new(NodalField::new(3));
    nodal.set_node_values(NodeId(1), &[1.0, 2.0, 2.0]).unwrap();
    let a = module.create_external(nodal.clone()).unwrap();
    let magnitude = module.create_magnitude(a).unwrap();
    let mut cache = module.create_field_cache();
    cache.set_node(NodeId(1));
    assert_eq!(values(&module, &mut cache, magnitude), vec![3.0]);
    module.assign_real(&mut cache, magnitude, &[6.0]).unwrap();
    assert_eq!(values(&module, &mut cache, magnitude), vec![6.0]);
    assert_eq!(
        nodal.node_values(NodeId(1)).unwrap(),
        DVector::from_vec(vec![2.0, 4.0, 4.0])
    );
    // a node without values: the source cannot be evaluated, nothing is written
    cache.set_node(NodeId(2));
    assert!(matches!(
        module.assign_real(&mut cache, magnitude, &[1.0]).unwrap_err(),
        FieldError::NotDefinedAtLocation(_)
    ));
    assert!(nodal.node_values(NodeId(2)).is_none());
}

#[test]
fn test_magnitude_assign_failures() {
    let mut module = FieldModule::new();
    let zero = module.create_constant(&[0.0, 0.0]).unwrap();
    let magnitude = module.create_magnitude(zero).unwrap();
    let mut cache = cache_at(&module, &[0.5]);
    assert!(matches!(
        module.assign_real(&mut cache, magnitude, &[2.0]).unwrap_err(),
        FieldError::ZeroMagnitude(_)
    ));
    assert_eq!(values(&module, &mut cache, zero), vec![0.0, 0.0]);

    // the source itself cannot take values
    let v = polynomial(&mut module, 1, vec![m(&[(1.0, &[1])]), m(&[(1.0, &[])])]);
    let magnitude = module.create_magnitude(v).unwrap();
    assert!(matches!(
        module.assign_real(&mut cache, magnitude, &[2.0]).unwrap_err(),
        FieldError::NotAssignable(_)
    ));
    let n = module.create_normalise(v).unwrap();
    assert!(matches!(
        module.assign_real(&mut cache, n, &[1.0, 0.0]).unwrap_err(),
        FieldError::NotAssignable(_)
    ));
}

////////////////////////////////////////////////////////////////
//  SUM COMPONENTS
////////////////////////////////////////////////////////////////
#[test]
fn test_sum_components_linearity() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut module = FieldModule::new();
    let mut cache = module.create_field_cache();
    for _ in 0..10 {
        let a: Vec<f64> = (0..5).map(|_| rng.random_range(-10.0..10.0)).collect();
        let b: Vec<f64> = (0..5).map(|_| rng.random_range(-10.0..10.0)).collect();
        let a_plus_b: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        let sums: Vec<f64> = [a, b, a_plus_b]
            .iter()
            .map(|v| {
                let field = module.create_constant(v).unwrap();
                let sum = module.create_sum_components(field).unwrap();
                module.evaluate(&mut cache, sum).unwrap()[0]
            })
            .collect();
        assert_relative_eq!(sums[2], sums[0] + sums[1], epsilon = 1e-10);
    }
}

#[test]
fn test_sum_components_derivatives_are_exact() {
    let mut module = FieldModule::new();
    // (x^3, x^2 y, y^3)
    let v = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[3])]), m(&[(1.0, &[2, 1])]), m(&[(1.0, &[0, 3])])],
    );
    let sum = module.create_sum_components(v).unwrap();
    let mut cache = cache_at(&module, &[0.3, -1.2]);
    let d3 = FieldDerivative::mesh(2, 3).unwrap();
    assert_eq!(module.derivative_tree_order(sum, &d3).unwrap(), 3);
    assert_eq!(
        derivative(&module, &mut cache, sum, &d3),
        DMatrix::from_row_slice(1, 8, &[6.0, 2.0, 2.0, 0.0, 2.0, 0.0, 0.0, 6.0])
    );
    let d1 = FieldDerivative::mesh(2, 1).unwrap();
    let source = derivative(&module, &mut cache, v, &d1);
    let result = derivative(&module, &mut cache, sum, &d1);
    for t in 0..2 {
        assert_eq!(result[(0, t)], source.column(t).sum());
    }
}

////////////////////////////////////////////////////////////////
//  CUBIC TEXTURE COORDINATES
////////////////////////////////////////////////////////////////
#[test]
fn test_cubic_texture_coordinates() {
    let mut module = FieldModule::new();
    let v = module.create_constant(&[1.0, -4.0, 2.0]).unwrap();
    let tie = module.create_constant(&[3.0, -3.0, 1.0]).unwrap();
    let zero = module.create_constant(&[0.0, 0.0, 0.0]).unwrap();
    let ctc = module.create_cubic_texture_coordinates(v).unwrap();
    let ctc_tie = module.create_cubic_texture_coordinates(tie).unwrap();
    let ctc_zero = module.create_cubic_texture_coordinates(zero).unwrap();
    let mut cache = module.create_field_cache();
    assert_eq!(values(&module, &mut cache, ctc), vec![0.25, 0.5, 4.0]);
    let result = values(&module, &mut cache, ctc_tie);
    assert_relative_eq!(result[0], -1.0);
    assert_relative_eq!(result[1], 1.0 / 3.0);
    assert_relative_eq!(result[2], 3.0);
    assert_eq!(values(&module, &mut cache, ctc_zero), vec![0.0, 0.0, 0.0]);

    // derivatives by finite differences: v = (x, 2, 0.5) near x = 1
    let v = polynomial(
        &mut module,
        1,
        vec![m(&[(1.0, &[1])]), m(&[(2.0, &[])]), m(&[(0.5, &[])])],
    );
    let ctc = module.create_cubic_texture_coordinates(v).unwrap();
    let mut cache = cache_at(&module, &[1.0]);
    let d1 = FieldDerivative::mesh(1, 1).unwrap();
    assert_relative_eq!(
        derivative(&module, &mut cache, ctc, &d1),
        DMatrix::from_column_slice(3, 1, &[0.5, 0.0, 0.0]),
        epsilon = 1e-8
    );
}

////////////////////////////////////////////////////////////////
//  FINITE DIFFERENCES
////////////////////////////////////////////////////////////////
#[test]
fn test_finite_difference_converges_with_step() {
    // n0 = x / sqrt(x^2 + 1): n0' = (x^2 + 1)^(-3/2), n0'' = -3x (x^2 + 1)^(-5/2)
    let x: f64 = 0.5;
    let first = |x: f64| (x * x + 1.0).powf(-1.5);
    let exact = -3.0 * x * (x * x + 1.0).powf(-2.5);
    let d2 = FieldDerivative::mesh(1, 2).unwrap();
    let mut errors = Vec::new();
    for step in [1e-2, 1e-3] {
        let settings = EvaluationSettings::default()
            .with_finite_difference_step(step)
            .unwrap();
        let mut module = FieldModule::new().with_settings(settings);
        let v = polynomial(&mut module, 1, vec![m(&[(1.0, &[1])]), m(&[(1.0, &[])])]);
        let n = module.create_normalise(v).unwrap();
        let mut cache = cache_at(&module, &[x]);
        let estimate = derivative(&module, &mut cache, n, &d2)[(0, 0)];
        let by_hand = (first(x + step) - first(x - step)) / (2.0 * step);
        assert_relative_eq!(estimate, by_hand, epsilon = 1e-9);
        errors.push((estimate - exact).abs());
    }
    assert!(errors[1] < errors[0]);
    assert!(errors[1] < 1e-5);
}

#[test]
fn test_finite_difference_one_sided_at_boundary() {
    let mut module = FieldModule::new();
    let f = module.create_external(Arc::new(HalfLine)).unwrap();
    let d1 = FieldDerivative::mesh(1, 1).unwrap();
    let mut cache = cache_at(&module, &[1.0]);
    assert_relative_eq!(derivative(&module, &mut cache, f, &d1)[(0, 0)], 2.0, epsilon = 1e-8);
    // at the boundary only the forward side exists
    cache.set_mesh_location(ElementId(1), &[0.0]);
    assert_relative_eq!(derivative(&module, &mut cache, f, &d1)[(0, 0)], 0.0, epsilon = 1e-4);
    cache.set_mesh_location(ElementId(1), &[-1.0]);
    assert!(matches!(
        module.evaluate_derivative(&mut cache, f, &d1).unwrap_err(),
        FieldError::NotDefinedAtLocation(_)
    ));
}

////////////////////////////////////////////////////////////////
//  PARAMETER DERIVATIVES
////////////////////////////////////////////////////////////////
#[test]
fn test_parameter_derivatives() {
    let mut module = FieldModule::new();
    // f = x p0^2 + p1
    let f = module
        .create_external(Arc::new(
            PolynomialField::new(1, 2)
                .with_component(vec![
                    Monomial::new(1.0, &[1], &[2]),
                    Monomial::new(1.0, &[], &[0, 1]),
                ])
                .unwrap(),
        ))
        .unwrap();
    let sum = module.create_sum_components(f).unwrap();
    let mut cache = cache_at(&module, &[0.5]);
    cache.set_parameters(&[3.0, 7.0]);
    assert_eq!(values(&module, &mut cache, sum), vec![11.5]);
    let dp = FieldDerivative::parameters(2, 1).unwrap();
    assert_eq!(
        derivative(&module, &mut cache, sum, &dp),
        DMatrix::from_row_slice(1, 2, &[3.0, 1.0])
    );
    let dp2 = FieldDerivative::parameters(2, 2).unwrap();
    assert_eq!(
        derivative(&module, &mut cache, sum, &dp2),
        DMatrix::from_row_slice(1, 4, &[1.0, 0.0, 0.0, 0.0])
    );
    let mixed = FieldDerivative::mixed(1, 1, 2, 1).unwrap();
    assert_eq!(
        derivative(&module, &mut cache, sum, &mixed),
        DMatrix::from_row_slice(1, 2, &[6.0, 0.0])
    );
    cache.set_parameters(&[3.0]);
    assert!(matches!(
        module.evaluate_derivative(&mut cache, sum, &dp).unwrap_err(),
        FieldError::DerivativeNotApplicable(_)
    ));
}

////////////////////////////////////////////////////////////////
//  CACHING AND INVALIDATION
////////////////////////////////////////////////////////////////
#[test]
fn test_shared_sources_evaluated_once_per_location() {
    let mut module = FieldModule::new();
    let provider = Arc::new(CountingProvider::default());
    let p = module.create_external(provider.clone()).unwrap();
    let dot = module.create_dot_product(p, p).unwrap();
    let magnitude = module.create_magnitude(p).unwrap();
    let sum = module.create_sum_components(p).unwrap();
    let mut cache = cache_at(&module, &[2.0]);
    assert_eq!(cache.value_cache_state(dot), CacheState::Unevaluated);
    assert_eq!(values(&module, &mut cache, dot), vec![9.0]);
    assert_eq!(values(&module, &mut cache, magnitude), vec![3.0]);
    assert_eq!(values(&module, &mut cache, sum), vec![5.0]);
    values(&module, &mut cache, dot);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.value_cache_state(dot), CacheState::Valid);

    cache.set_mesh_location(ElementId(1), &[0.0]);
    assert_eq!(cache.value_cache_state(dot), CacheState::Invalidated);
    assert_eq!(values(&module, &mut cache, sum), vec![3.0]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.value_cache_state(dot), CacheState::Invalidated);
    assert_eq!(values(&module, &mut cache, dot), vec![5.0]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_assignment_invalidates_dependents_in_every_cache() {
    let mut module = FieldModule::new();
    let c = module.create_constant(&[3.0, 4.0]).unwrap();
    let other = module.create_constant(&[1.0]).unwrap();
    let n = module.create_normalise(c).unwrap();
    let s = module.create_sum_components(n).unwrap();
    let mut writer = module.create_field_cache();
    let mut reader = module.create_field_cache();
    assert_relative_eq!(values(&module, &mut reader, s)[0], 1.4);
    values(&module, &mut reader, other);

    module.assign_real(&mut writer, c, &[0.0, 2.0]).unwrap();
    values(&module, &mut reader, other);
    assert_eq!(reader.value_cache_state(other), CacheState::Valid);
    assert_eq!(reader.value_cache_state(n), CacheState::Invalidated);
    assert_eq!(reader.value_cache_state(s), CacheState::Invalidated);
    assert_relative_eq!(values(&module, &mut reader, s)[0], 1.0);
}

#[test]
fn test_batched_changes_apply_together() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[1.0, 0.0]).unwrap();
    let b = module.create_constant(&[1.0, 0.0]).unwrap();
    let dot = module.create_dot_product(a, b).unwrap();
    let mut writer = module.create_field_cache();
    let mut reader = module.create_field_cache();
    assert_eq!(values(&module, &mut reader, dot), vec![1.0]);
    {
        let _change = module.change_guard();
        module.assign_real(&mut writer, a, &[2.0, 0.0]).unwrap();
        // mid-batch the reader keeps its consistent old state
        assert_eq!(values(&module, &mut reader, dot), vec![1.0]);
        module.assign_real(&mut writer, b, &[3.0, 0.0]).unwrap();
        assert_eq!(values(&module, &mut reader, dot), vec![1.0]);
    }
    assert_eq!(values(&module, &mut reader, dot), vec![6.0]);
    // unmatched end_change is ignored
    module.end_change();
    module.assign_real(&mut writer, a, &[1.0, 0.0]).unwrap();
    assert_eq!(values(&module, &mut reader, dot), vec![3.0]);
}

#[test]
fn test_failed_evaluation_writes_nothing() {
    let mut module = FieldModule::new();
    let nodal = Arc::new(NodalField::new(2));
    nodal.set_node_values(NodeId(1), &[1.0, 2.0]).unwrap();
    let a = module.create_external(nodal).unwrap();
    let b = module.create_constant(&[1.0, 1.0]).unwrap();
    let dot = module.create_dot_product(a, b).unwrap();
    let magnitude = module.create_magnitude(dot).unwrap();
    let mut cache = module.create_field_cache();
    let mut out = [-7.0];
    assert_eq!(
        module.evaluate_real(&mut cache, magnitude, &mut out).unwrap_err(),
        FieldError::LocationNotSet
    );
    cache.set_node(NodeId(2));
    assert!(matches!(
        module.evaluate_real(&mut cache, magnitude, &mut out).unwrap_err(),
        FieldError::NotDefinedAtLocation(_)
    ));
    assert_eq!(out, [-7.0]);
    assert_eq!(cache.value_cache_state(dot), CacheState::Unevaluated);
    assert_eq!(cache.value_cache_state(magnitude), CacheState::Unevaluated);
    cache.set_node(NodeId(1));
    module.evaluate_real(&mut cache, magnitude, &mut out).unwrap();
    assert_eq!(out, [3.0]);
    let mut wrong = [0.0; 2];
    assert!(module.evaluate_real(&mut cache, magnitude, &mut wrong).is_err());
}

////////////////////////////////////////////////////////////////
//  REMOVAL AND REDEFINITION
////////////////////////////////////////////////////////////////
#[test]
fn test_remove_field_in_use() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[1.0, 2.0]).unwrap();
    let n = module.create_normalise(a).unwrap();
    let name = module.get_field_name(a).unwrap();
    assert_eq!(module.remove_field(a).unwrap_err(), FieldError::FieldInUse(name.clone()));
    module.remove_field(n).unwrap();
    module.remove_field(a).unwrap();
    assert_eq!(module.find_field_by_name(&name), None);
    assert_eq!(module.number_of_fields(), 0);
    assert_eq!(module.remove_field(a).unwrap_err(), FieldError::StaleField);
}

#[test]
fn test_redefine_field() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[3.0, 4.0]).unwrap();
    let b = module.create_constant(&[1.0, 0.0]).unwrap();
    let n = module.create_normalise(a).unwrap();
    let magnitude = module.create_magnitude(n).unwrap();
    let mut cache = module.create_field_cache();
    assert_relative_eq!(values(&module, &mut cache, n)[0], 0.6);

    module
        .redefine_field(a, Constant::definition(&[0.0, 5.0]).unwrap())
        .unwrap();
    assert_relative_eq!(values(&module, &mut cache, n)[1], 1.0);

    // normalise b instead of a
    let definition = module.definition(n).unwrap();
    let mut redefinition = definition.clone();
    redefinition.source_fields = vec![b];
    module.redefine_field(n, redefinition).unwrap();
    assert_eq!(module.source_fields(n).unwrap(), vec![b]);
    assert_eq!(values(&module, &mut cache, n), vec![1.0, 0.0]);

    assert!(matches!(
        module
            .redefine_field(a, Constant::definition(&[1.0]).unwrap())
            .unwrap_err(),
        FieldError::ComponentCountMismatch { .. }
    ));
    // b -> normalise(n) would close the loop n -> b -> n
    let cyclic = crate::computed_field::vector_operators::Normalise::definition(&module, n).unwrap();
    assert!(matches!(
        module.redefine_field(b, cyclic).unwrap_err(),
        FieldError::CyclicDependency(_)
    ));
    let self_loop = crate::computed_field::vector_operators::Magnitude::definition(&module, magnitude).unwrap();
    assert!(matches!(
        module.redefine_field(magnitude, self_loop).unwrap_err(),
        FieldError::CyclicDependency(_)
    ));
    assert!(module.depends_on(magnitude, b));
    assert!(!module.depends_on(magnitude, a));
}

////////////////////////////////////////////////////////////////
//  CONCURRENCY
////////////////////////////////////////////////////////////////
#[test]
fn test_independent_caches_on_threads() {
    let mut module = FieldModule::new();
    // v = (x, y, 1); dot(normalise(v), v) = |v|
    let v = polynomial(
        &mut module,
        2,
        vec![m(&[(1.0, &[1])]), m(&[(1.0, &[0, 1])]), m(&[(1.0, &[])])],
    );
    let n = module.create_normalise(v).unwrap();
    let dot = module.create_dot_product(n, v).unwrap();
    let caches: Vec<FieldCache> = (0..4).map(|_| module.create_field_cache()).collect();
    let module = &module;
    std::thread::scope(|scope| {
        for (t, mut cache) in caches.into_iter().enumerate() {
            scope.spawn(move || {
                for i in 0..50 {
                    let x = t as f64 + i as f64 * 0.01;
                    let y = -(i as f64) * 0.02;
                    cache.set_mesh_location(ElementId(t), &[x, y]);
                    let value = module.evaluate(&mut cache, dot).unwrap()[0];
                    assert_relative_eq!(value, (x * x + y * y + 1.0).sqrt(), epsilon = 1e-12);
                }
            });
        }
    });
}

/// x on a 1D element, counting how often its tree order is asked for
#[derive(Debug, Default)]
struct CountingLine {
    tree_order_calls: AtomicUsize,
}

impl FieldProvider for CountingLine {
    fn number_of_components(&self) -> usize {
        1
    }

    fn evaluate(&self, point: &EvaluationPoint<'_>) -> Option<DVector<f64>> {
        Some(DVector::from_element(1, point.xi()?[0]))
    }

    fn evaluate_derivative(
        &self,
        _point: &EvaluationPoint<'_>,
        derivative: &FieldDerivative,
    ) -> Option<DMatrix<f64>> {
        let slope = if derivative.total_order() == 1 { 1.0 } else { 0.0 };
        Some(DMatrix::from_element(1, derivative.term_count(), slope))
    }

    fn derivative_tree_order(&self, derivative: &FieldDerivative) -> usize {
        self.tree_order_calls.fetch_add(1, Ordering::SeqCst);
        derivative.total_order().min(1)
    }
}

#[test]
fn test_deep_shared_chain_tree_order_computed_once() {
    let mut module = FieldModule::new();
    let line = Arc::new(CountingLine::default());
    let mut f = module.create_external(line.clone()).unwrap();
    // f_n = f_(n-1) . f_(n-1) = x^(2^n)
    for _ in 0..40 {
        f = module.create_dot_product(f, f).unwrap();
    }
    let mut cache = cache_at(&module, &[1.0]);
    let d1 = FieldDerivative::mesh(1, 1).unwrap();
    let d = derivative(&module, &mut cache, f, &d1);
    assert_eq!(d[(0, 0)], 2f64.powi(40));
    assert_eq!(line.tree_order_calls.load(Ordering::SeqCst), 1);
    // a second request at a new location reuses the orders
    cache.set_mesh_location(ElementId(1), &[0.5]);
    derivative(&module, &mut cache, f, &d1);
    assert_eq!(line.tree_order_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_tree_orders_follow_redefinition() {
    let mut module = FieldModule::new();
    let u = polynomial(&mut module, 1, vec![m(&[(1.0, &[1])])]);
    let c = module.create_constant(&[2.0]).unwrap();
    let s = module.create_sum_components(u).unwrap();
    let d1 = FieldDerivative::mesh(1, 1).unwrap();
    assert_eq!(module.derivative_tree_order(s, &d1).unwrap(), 1);
    let constant_sum = module.create_sum_components(c).unwrap();
    let definition = module.definition(constant_sum).unwrap();
    module.redefine_field(s, definition).unwrap();
    assert_eq!(module.derivative_tree_order(s, &d1).unwrap(), 0);
}

#[test]
fn test_assignments_in_one_bracket_see_each_other() {
    let mut module = FieldModule::new();
    let a = module.create_constant(&[3.0, 4.0]).unwrap();
    let length = module.create_magnitude(a).unwrap();
    let mut writer = module.create_field_cache();
    let mut reader = module.create_field_cache();
    assert_eq!(values(&module, &mut writer, a), vec![3.0, 4.0]);
    assert_eq!(values(&module, &mut reader, length), vec![5.0]);
    {
        let _guard = module.change_guard();
        module.assign_real(&mut writer, a, &[0.0, 1.0]).unwrap();
        assert_eq!(values(&module, &mut writer, length), vec![1.0]);
        module.assign_real(&mut writer, length, &[10.0]).unwrap();
        assert_eq!(values(&module, &mut writer, a), vec![0.0, 10.0]);
        // other caches only hear about the batch when it closes
        assert_eq!(values(&module, &mut reader, length), vec![5.0]);
    }
    assert_eq!(values(&module, &mut writer, a), vec![0.0, 10.0]);
    assert_eq!(values(&module, &mut reader, length), vec![10.0]);
    assert_eq!(values(&module, &mut reader, a), vec![0.0, 10.0]);
}
