/// worked examples of field graphs: vector operators, derivatives, assignment, commands
pub mod vector_field_examples;
