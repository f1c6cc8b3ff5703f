//! Evaluation settings of a field module, read from a TOML document like
//! ```toml
//! [evaluation]
//! finite_difference_step = 1e-6
//! zero_magnitude = "fail"      # or "zero"
//! log_level = "debug"
//! ```
//! Missing keys keep their defaults; unknown keys are rejected.
use crate::computed_field::errors::FieldError;
use simplelog::LevelFilter;
use std::path::Path;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use toml::{Table, Value};

/// What to do where a vector of zero length would be divided by its length
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ZeroMagnitudePolicy {
    /// substitute zero: all-zero values and derivatives
    #[default]
    Zero,
    /// fail with `FieldError::ZeroMagnitude`
    Fail,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationSettings {
    pub finite_difference_step: f64,
    pub zero_magnitude_policy: ZeroMagnitudePolicy,
    pub log_level: LevelFilter,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        EvaluationSettings {
            finite_difference_step: 1e-5,
            zero_magnitude_policy: ZeroMagnitudePolicy::Zero,
            log_level: LevelFilter::Info,
        }
    }
}

impl EvaluationSettings {
    pub fn with_finite_difference_step(mut self, step: f64) -> Result<Self, FieldError> {
        check_step(step)?;
        self.finite_difference_step = step;
        Ok(self)
    }

    pub fn with_zero_magnitude_policy(mut self, policy: ZeroMagnitudePolicy) -> Self {
        self.zero_magnitude_policy = policy;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, FieldError> {
        let document = text
            .parse::<Table>()
            .map_err(|e| FieldError::Config(format!("invalid TOML: {}", e)))?;
        let mut settings = EvaluationSettings::default();
        for (section, value) in &document {
            if section != "evaluation" {
                return Err(FieldError::Config(format!("unknown section '{}'", section)));
            }
            let Value::Table(table) = value else {
                return Err(FieldError::Config("'evaluation' must be a table".to_string()));
            };
            for (key, value) in table {
                match key.as_str() {
                    "finite_difference_step" => {
                        let step = match value {
                            Value::Float(step) => *step,
                            Value::Integer(step) => *step as f64,
                            _ => return Err(type_error(key, "a number")),
                        };
                        check_step(step)?;
                        settings.finite_difference_step = step;
                    }
                    "zero_magnitude" => {
                        let text = value.as_str().ok_or_else(|| type_error(key, "a string"))?;
                        settings.zero_magnitude_policy = ZeroMagnitudePolicy::from_str(text)
                            .map_err(|_| {
                                FieldError::Config(format!(
                                    "zero_magnitude must be \"zero\" or \"fail\", found \"{}\"",
                                    text
                                ))
                            })?;
                    }
                    "log_level" => {
                        let text = value.as_str().ok_or_else(|| type_error(key, "a string"))?;
                        settings.log_level = LevelFilter::from_str(text).map_err(|_| {
                            FieldError::Config(format!("unknown log level \"{}\"", text))
                        })?;
                    }
                    _ => return Err(FieldError::Config(format!("unknown key '{}'", key))),
                }
            }
        }
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FieldError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FieldError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

fn check_step(step: f64) -> Result<(), FieldError> {
    if step.is_finite() && step > 0.0 {
        Ok(())
    } else {
        Err(FieldError::Config(format!(
            "finite_difference_step must be positive and finite, found {}",
            step
        )))
    }
}

fn type_error(key: &str, expected: &str) -> FieldError {
    FieldError::Config(format!("'{}' must be {}", key, expected))
}
