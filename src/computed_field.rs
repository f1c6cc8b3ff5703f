//! # Computed fields
//!
//! Graphs of composable scalar and vector fields evaluated at locations of a finite element
//! model. A `FieldModule` owns the fields; each field is an operator (`FieldCore`) applied
//! to ordered source fields. Values and derivatives are evaluated through a `FieldCache`,
//! which binds the location and memoizes every field evaluated there.
//!
//! ```
//! use RustedFields::computed_field::field_module::FieldModule;
//! let mut module = FieldModule::new();
//! let a = module.create_constant(&[2.0, 0.0, 0.0]).unwrap();
//! let b = module.create_constant(&[0.0, 1.5, 0.0]).unwrap();
//! let c = module.create_cross_product(3, &[a, b]).unwrap();
//! let mut cache = module.create_field_cache();
//! assert_eq!(module.evaluate(&mut cache, c).unwrap().as_slice(), &[0.0, 0.0, 3.0]);
//! ```
/// error type of the crate
pub mod errors;
/// command strings, field type registry and listings
pub mod field_commands;
/// evaluation context: location, parameters, value caches
pub mod field_cache;
/// operator dispatch
pub mod field_core;
/// derivative descriptors
pub mod field_derivative;
/// arena of fields, evaluation and change manager
pub mod field_module;
/// finite-difference derivatives
pub mod finite_difference;
/// constant and external (provider backed) fields
pub mod source_fields;
/// per-field value and derivative storage
pub mod value_cache;
/// normalise, cross product, dot product, magnitude, sum of components, cubic texture coordinates
pub mod vector_operators;
#[cfg(test)]
mod vector_operators_tests;
