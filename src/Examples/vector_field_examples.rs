use crate::Utils::settings::EvaluationSettings;
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::{ElementId, NodeId};
use crate::computed_field::field_derivative::FieldDerivative;
use crate::computed_field::field_module::FieldModule;
use crate::computed_field::source_fields::{Monomial, NodalField, PolynomialField};
use log::{error, info};
use nalgebra::DMatrix;
use std::sync::Arc;

pub fn vector_field_examples(example: usize, settings: &EvaluationSettings) {
    let module = FieldModule::new().with_settings(settings.clone());
    let result = match example {
        0 => vector_operators(module),
        1 => derivatives_in_element(module),
        2 => assign_magnitude_at_node(module),
        3 => commands_and_listing(module),
        _ => {
            println!("no example {}", example);
            Ok(())
        }
    };
    if let Err(e) = result {
        error!("example {} failed: {}", example, e);
    }
}

// cross product, dot product, sum of components and normalise of constant vectors
fn vector_operators(mut module: FieldModule) -> Result<(), FieldError> {
    let a = module.create_constant(&[2.0, 0.0, 0.0])?;
    let b = module.create_constant(&[0.0, 1.5, 0.0])?;
    let cross = module.create_cross_product(3, &[a, b])?;
    let dot = module.create_dot_product(a, b)?;
    let planar = module.create_constant(&[1.0, 1.0])?;
    let rotated = module.create_cross_product(2, &[planar])?;
    let v = module.create_constant(&[2.0, 4.0, 6.0])?;
    let sum = module.create_sum_components(v)?;
    let unit = module.create_normalise(v)?;
    let length = module.create_magnitude(unit)?;

    let mut cache = module.create_field_cache();
    for field in [cross, dot, rotated, sum, unit, length] {
        let values = module.evaluate(&mut cache, field)?;
        println!(
            "{} = {:?}",
            module.get_field_name(field).unwrap_or_default(),
            values.as_slice()
        );
    }
    println!("{}", module.list_fields());
    Ok(())
}

// first and second xi derivatives of |u|^2 for an affine vector field over a 2D element
fn derivatives_in_element(mut module: FieldModule) -> Result<(), FieldError> {
    let gradient = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 2.0, 1.0, 1.0]);
    let affine = PolynomialField::affine(&[0.5, 0.0, 1.0], &gradient)?;
    let u = module.create_external(Arc::new(affine))?;
    let u_dot_u = module.create_dot_product(u, u)?;
    let direction = module.create_normalise(u)?;

    let mut cache = module.create_field_cache();
    let first = FieldDerivative::mesh(2, 1)?;
    let second = FieldDerivative::mesh(2, 2)?;
    for xi in [[0.0, 0.0], [0.25, 0.5], [1.0, 1.0]] {
        cache.set_mesh_location(ElementId(1), &xi);
        let value = module.evaluate(&mut cache, u_dot_u)?;
        let d1 = module.evaluate_derivative(&mut cache, u_dot_u, &first)?;
        let d2 = module.evaluate_derivative(&mut cache, u_dot_u, &second)?;
        let dn = module.evaluate_derivative(&mut cache, direction, &first)?;
        info!(
            "xi = {:?}: u.u = {}, d/dxi = {:?}, d2/dxi2 = {:?}",
            xi,
            value[0],
            d1.as_flat(),
            d2.as_flat()
        );
        println!("d normalise(u)/dxi at {:?}:\n{}", xi, dn.values);
    }

    // parameter derivative of a field depending on p0 * xi0
    let scaled = PolynomialField::new(1, 1)
        .with_component(vec![Monomial::new(3.0, &[1], &[1])])?;
    let s = module.create_external(Arc::new(scaled))?;
    let s_squared = module.create_dot_product(s, s)?;
    cache.set_mesh_location(ElementId(2), &[0.5]);
    cache.set_parameters(&[2.0]);
    let by_parameter = FieldDerivative::parameters(1, 1)?;
    let dp = module.evaluate_derivative(&mut cache, s_squared, &by_parameter)?;
    println!("d(s.s)/dp = {:?}", dp.as_flat());
    Ok(())
}

// assigning a magnitude rescales the stored nodal vector
fn assign_magnitude_at_node(mut module: FieldModule) -> Result<(), FieldError> {
    let nodal = Arc::new(NodalField::new(3));
    nodal.set_node_values(NodeId(7), &[3.0, 0.0, 4.0])?;
    let velocity = module.create_external(nodal.clone())?;
    let speed = module.create_magnitude(velocity)?;
    module.set_field_name(velocity, "velocity")?;
    module.set_field_name(speed, "speed")?;

    let mut cache = module.create_field_cache();
    cache.set_node(NodeId(7));
    println!("speed before = {}", module.evaluate(&mut cache, speed)?[0]);
    module.assign_real(&mut cache, speed, &[10.0])?;
    println!("speed after = {}", module.evaluate(&mut cache, speed)?[0]);
    println!("velocity after = {:?}", nodal.node_values(NodeId(7)));
    Ok(())
}

// defining fields from command strings and listing them
fn commands_and_listing(mut module: FieldModule) -> Result<(), FieldError> {
    module.define_field("a", "constant 2 4 6")?;
    module.define_field("b", "constant 1 0 0")?;
    let cross = module.define_field("a_cross_b", "cross_product dimension 3 fields a b")?;
    module.define_field("s", "sum_components field a")?;
    module.define_field("t", "cubic_texture_coordinates field a")?;
    println!("{}", module.list_field(cross)?);
    println!("{}", module.command_string(cross)?);
    // redefinition by name keeps the handle
    let redefined = module.define_field("a_cross_b", "cross_product dimension 3 fields b a")?;
    info!("handle kept after redefinition: {}", redefined == cross);
    println!("{}", module.list_fields());
    let mut cache = module.create_field_cache();
    println!("a x b = {:?}", module.evaluate(&mut cache, cross)?.as_slice());
    Ok(())
}
