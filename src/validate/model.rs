//! Record validation against model field constraints

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::config::DEFAULT_MAX_ERROR_COUNT;
use crate::error::{CrudError, FieldValidationError, Result};
use crate::schema::TypeConstraint;

/// Tuning for a [`ModelValidator`].
#[derive(Debug, Clone)]
pub struct ModelValidatorOptions {
    /// Field errors accumulated before validation gives up on a record.
    pub max_error_count: usize,
}

impl Default for ModelValidatorOptions {
    fn default() -> Self {
        Self {
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
        }
    }
}

/// Validates records against one model's declared field constraints.
pub struct ModelValidator {
    model: String,
    fields: BTreeMap<String, TypeConstraint>,
    max_error_count: usize,
}

/// Build a validator for `model` over its field constraints.
pub fn build_model_validator(
    model: impl Into<String>,
    fields: BTreeMap<String, TypeConstraint>,
    options: ModelValidatorOptions,
) -> ModelValidator {
    ModelValidator {
        model: model.into(),
        fields,
        max_error_count: options.max_error_count.max(1),
    }
}

impl ModelValidator {
    /// Validate a record and return its sanitized copy.
    ///
    /// With `allow_partial`, only the fields present in the record are
    /// checked; otherwise every declared field runs through its constraint.
    /// Either way, record fields that are not in the schema are errors.
    /// Failures accumulate (up to the configured cap) into a single
    /// validation error, unless `throw_immediate` reports the first one.
    pub fn validate(
        &self,
        record: &Map<String, Value>,
        allow_partial: bool,
        throw_immediate: bool,
    ) -> Result<Map<String, Value>> {
        let mut sanitized = Map::new();
        let mut errors: Vec<FieldValidationError> = Vec::new();

        if allow_partial {
            for (field, value) in record {
                match self.fields.get(field) {
                    Some(constraint) => match constraint.check(Some(value)) {
                        Ok(Some(clean)) => {
                            sanitized.insert(field.clone(), clean);
                        }
                        Ok(None) => {}
                        Err(message) => {
                            self.push_error(&mut errors, field, message, throw_immediate)?;
                        }
                    },
                    None => {
                        self.push_error(
                            &mut errors,
                            field,
                            "Field is not part of the schema".to_string(),
                            throw_immediate,
                        )?;
                    }
                }
                if errors.len() >= self.max_error_count {
                    break;
                }
            }
        } else {
            for (field, constraint) in &self.fields {
                match constraint.check(record.get(field)) {
                    Ok(Some(clean)) => {
                        sanitized.insert(field.clone(), clean);
                    }
                    Ok(None) => {}
                    Err(message) => {
                        self.push_error(&mut errors, field, message, throw_immediate)?;
                    }
                }
                if errors.len() >= self.max_error_count {
                    break;
                }
            }
            if errors.len() < self.max_error_count {
                for field in record.keys() {
                    if !self.fields.contains_key(field) {
                        self.push_error(
                            &mut errors,
                            field,
                            "Field is not part of the schema".to_string(),
                            throw_immediate,
                        )?;
                        if errors.len() >= self.max_error_count {
                            break;
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(sanitized)
        } else {
            Err(self.aggregate(errors))
        }
    }

    /// Check that removing `field` from a record is permissible.
    pub fn check_removal(&self, field: &str) -> Result<()> {
        match self.fields.get(field) {
            None => Err(CrudError::validation_single(
                &self.model,
                field,
                "Field is not part of the schema",
            )),
            Some(constraint) if constraint.is_required() => Err(CrudError::validation_single(
                &self.model,
                field,
                "Field is required and cannot be removed",
            )),
            Some(_) => Ok(()),
        }
    }

    /// The model this validator covers.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn push_error(
        &self,
        errors: &mut Vec<FieldValidationError>,
        field: &str,
        message: String,
        throw_immediate: bool,
    ) -> Result<()> {
        if throw_immediate {
            return Err(CrudError::validation_single(&self.model, field, message));
        }
        errors.push(FieldValidationError {
            model: self.model.clone(),
            field: field.to_string(),
            message,
        });
        Ok(())
    }

    fn aggregate(&self, errors: Vec<FieldValidationError>) -> CrudError {
        CrudError::Validation {
            model: self.model.clone(),
            field: errors.first().map(|e| e.field.clone()),
            field_errors: errors,
        }
    }
}
