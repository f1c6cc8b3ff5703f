//! # Field commands
//!
//! Text surface of a field module: every field can describe itself as a command string
//! such as `cross_product dimension 3 fields a b`, and `define_field` builds (or redefines)
//! a named field from such a string. Command keywords are looked up in an explicit
//! `FieldTypeRegistry` owned by the module.
//!
//! Grammar:
//! ```text
//! command   := keyword [ "dimension" integer ] [ ("field" | "fields") name+ ] [ number+ ]
//! ```
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_core::{ComputedFieldCore, FieldContext, FieldDefinition, FieldKind};
use crate::computed_field::field_module::{FieldId, FieldModule};
use crate::computed_field::source_fields::Constant;
use crate::computed_field::vector_operators::{
    CrossProduct, CubicTextureCoordinates, DotProduct, Magnitude, Normalise, SumComponents,
};
use log::info;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, multispace0, multispace1},
    combinator::{map_res, opt},
    multi::many1,
    number::complete::double,
    sequence::preceded,
};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use tabled::{builder::Builder, settings::Style};

////////////////////////////////////////////////////////////////
//  REGISTRY
////////////////////////////////////////////////////////////////
/// Command keywords of the field types that can be defined from text
#[derive(Clone, Debug)]
pub struct FieldTypeRegistry {
    types: BTreeMap<String, FieldKind>,
}

impl Default for FieldTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldTypeRegistry {
    /// Registry of every definable field type
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for kind in FieldKind::iter() {
            registry.register(kind);
        }
        registry
    }

    pub fn empty() -> Self {
        FieldTypeRegistry {
            types: BTreeMap::new(),
        }
    }

    /// External fields wrap providers that have no textual form
    pub fn is_definable(kind: FieldKind) -> bool {
        kind != FieldKind::External
    }

    /// false if the kind cannot be defined from text or is already registered
    pub fn register(&mut self, kind: FieldKind) -> bool {
        if !Self::is_definable(kind) {
            return false;
        }
        self.types.insert(kind.to_string(), kind).is_none()
    }

    pub fn unregister(&mut self, keyword: &str) -> Option<FieldKind> {
        self.types.remove(keyword)
    }

    pub fn lookup(&self, keyword: &str) -> Option<FieldKind> {
        self.types.get(keyword).copied()
    }

    pub fn keywords(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

////////////////////////////////////////////////////////////////
//  PARSER
////////////////////////////////////////////////////////////////
#[derive(Clone, Debug, PartialEq)]
pub struct FieldCommand {
    pub keyword: String,
    pub dimension: Option<usize>,
    pub source_names: Vec<String>,
    pub values: Vec<f64>,
}

fn keyword(input: &str) -> IResult<&str, &str> {
    preceded(
        multispace0,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
    .parse(input)
}

fn name(input: &str) -> IResult<&str, &str> {
    preceded(multispace1, take_while1(|c: char| !c.is_whitespace())).parse(input)
}

fn dimension_clause(input: &str) -> IResult<&str, usize> {
    preceded(
        (multispace1, tag("dimension"), multispace1),
        map_res(digit1, |digits: &str| digits.parse::<usize>()),
    )
    .parse(input)
}

fn fields_clause(input: &str) -> IResult<&str, Vec<&str>> {
    preceded(
        (multispace1, alt((tag("fields"), tag("field")))),
        many1(name),
    )
    .parse(input)
}

fn values_clause(input: &str) -> IResult<&str, Vec<f64>> {
    many1(preceded(multispace1, double)).parse(input)
}

fn command(input: &str) -> IResult<&str, FieldCommand> {
    let (input, keyword) = keyword(input)?;
    let (input, dimension) = opt(dimension_clause).parse(input)?;
    let (input, source_names) = opt(fields_clause).parse(input)?;
    let (input, values) = opt(values_clause).parse(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>(input)?;
    Ok((
        input,
        FieldCommand {
            keyword: keyword.to_string(),
            dimension,
            source_names: source_names
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
            values: values.unwrap_or_default(),
        },
    ))
}

pub fn parse_command(text: &str) -> Result<FieldCommand, FieldError> {
    match command(text) {
        Ok(("", parsed)) => Ok(parsed),
        Ok((rest, _)) => Err(FieldError::Parse(format!(
            "unexpected '{}' in '{}'",
            rest.trim(),
            text
        ))),
        Err(error) => Err(FieldError::Parse(format!("'{}': {}", text, error))),
    }
}

fn single_source(sources: &[FieldId]) -> Result<FieldId, FieldError> {
    match sources {
        [source] => Ok(*source),
        _ => Err(FieldError::InvalidSourceCount {
            expected: 1,
            found: sources.len(),
        }),
    }
}

////////////////////////////////////////////////////////////////
//  MODULE TEXT SURFACE
////////////////////////////////////////////////////////////////
impl FieldModule {
    /// Validated definition described by a parsed command
    pub fn command_definition(&self, command: &FieldCommand) -> Result<FieldDefinition, FieldError> {
        let kind = self
            .registry()
            .lookup(&command.keyword)
            .ok_or_else(|| FieldError::Parse(format!("unknown field type '{}'", command.keyword)))?;
        let sources = command
            .source_names
            .iter()
            .map(|name| {
                self.find_field_by_name(name)
                    .ok_or_else(|| FieldError::UnknownFieldName(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if command.dimension.is_some() && kind != FieldKind::CrossProduct {
            return Err(FieldError::Parse(format!(
                "'{}' takes no dimension",
                command.keyword
            )));
        }
        if !command.values.is_empty() && kind != FieldKind::Constant {
            return Err(FieldError::Parse(format!(
                "'{}' takes no values",
                command.keyword
            )));
        }
        match kind {
            FieldKind::Constant => {
                if !sources.is_empty() {
                    return Err(FieldError::InvalidSourceCount {
                        expected: 0,
                        found: sources.len(),
                    });
                }
                Constant::definition(&command.values)
            }
            FieldKind::Normalise => Normalise::definition(self, single_source(&sources)?),
            FieldKind::CrossProduct => {
                let dimension = command.dimension.unwrap_or(sources.len() + 1);
                CrossProduct::definition(self, dimension, &sources)
            }
            FieldKind::DotProduct => match sources.as_slice() {
                [a, b] => DotProduct::definition(self, *a, *b),
                _ => Err(FieldError::InvalidSourceCount {
                    expected: 2,
                    found: sources.len(),
                }),
            },
            FieldKind::Magnitude => Magnitude::definition(self, single_source(&sources)?),
            FieldKind::SumComponents => SumComponents::definition(self, single_source(&sources)?),
            FieldKind::CubicTextureCoordinates => {
                CubicTextureCoordinates::definition(self, single_source(&sources)?)
            }
            FieldKind::External => Err(FieldError::Parse(
                "external fields cannot be defined from text".to_string(),
            )),
        }
    }

    /// Define field `name` from a command string; an existing field of that name is
    /// redefined in place
    pub fn define_field(&mut self, name: &str, command: &str) -> Result<FieldId, FieldError> {
        let parsed = parse_command(command)?;
        let definition = self.command_definition(&parsed)?;
        match self.find_field_by_name(name) {
            Some(existing) => {
                self.redefine_field(existing, definition)?;
                Ok(existing)
            }
            None => {
                let field = self.create_named_field(name, definition)?;
                info!("defined field '{}' as '{}'", name, command.trim());
                Ok(field)
            }
        }
    }

    fn with_context<T>(
        &self,
        field: FieldId,
        f: impl FnOnce(&FieldContext<'_>, &FieldDefinition) -> T,
    ) -> Result<T, FieldError> {
        let definition = self.definition(field)?;
        let name = self.get_field_name(field).unwrap_or_default();
        let ctx = FieldContext {
            module: self,
            field,
            name: &name,
            source_fields: &definition.source_fields,
            number_of_components: definition.number_of_components,
        };
        Ok(f(&ctx, &definition))
    }

    /// Command string that recreates the field with `define_field`
    pub fn command_string(&self, field: FieldId) -> Result<String, FieldError> {
        self.with_context(field, |ctx, definition| {
            let arguments = definition.core.command_arguments(ctx);
            format!("{} {}", definition.core.kind(), arguments)
                .trim_end()
                .to_string()
        })
    }

    /// Multi-line description of one field
    pub fn list_field(&self, field: FieldId) -> Result<String, FieldError> {
        let command = self.command_string(field)?;
        self.with_context(field, |ctx, definition| {
            let mut lines = vec![
                format!("field : {}", ctx.name),
                format!("type : {}", definition.core.type_string()),
                format!("number of components : {}", definition.number_of_components),
            ];
            if !definition.source_fields.is_empty() {
                let sources = (0..definition.source_fields.len())
                    .map(|i| ctx.source_name(i))
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!("source fields : {}", sources));
            }
            for (key, value) in definition.core.list_details(ctx) {
                lines.push(format!("{} : {}", key, value));
            }
            lines.push(format!("command : {}", command));
            lines.join("\n")
        })
    }

    /// Summary table of all fields
    pub fn list_fields(&self) -> String {
        let mut builder = Builder::default();
        builder.push_record(vec![
            "name".to_string(),
            "type".to_string(),
            "components".to_string(),
            "sources".to_string(),
        ]);
        for field in self.fields() {
            let sources = self
                .source_fields(field)
                .unwrap_or_default()
                .into_iter()
                .map(|source| self.get_field_name(source).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(" ");
            builder.push_record(vec![
                self.get_field_name(field).unwrap_or_default(),
                self.type_string(field).unwrap_or_default(),
                self.number_of_components(field)
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                sources,
            ]);
        }
        let mut table = builder.build();
        table.with(Style::modern_rounded());
        table.to_string()
    }
}
