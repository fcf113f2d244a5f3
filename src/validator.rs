// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parameter validation.
//!
//! Schemas are opaque to the broker core; the validator compiles them
//! into checkers once, when an action is registered, and the compiled
//! checker runs on every local invocation before the handler.

use serde_json::{json, Value};

use std::{fmt, sync::Arc};

use crate::errors::BrokerError;

/// A compiled parameter checker. Returns the list of field issues, empty
/// on success.
pub type Checker = Arc<dyn Fn(&Value) -> Vec<FieldIssue> + Send + Sync>;

/// One invalid field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    /// Field name.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldIssue {
    /// JSON form carried in the `data` of a VALIDATION_ERROR.
    pub fn to_value(&self) -> Value {
        json!({ "field": self.field, "message": self.message })
    }
}

/// Compiles parameter schemas into checkers.
pub trait Validator: Send + Sync + fmt::Debug {
    /// Compiles a schema. Schema shapes the validator does not understand
    /// must compile into an accept-all checker, not fail registration.
    fn compile(&self, schema: &Value) -> Checker;
}

/// Field-type validator, the default.
///
/// Understands schemas of the form `{ "field": <rule> }` where a rule is
/// either a type name (`"number"`, `"string"`, `"boolean"`, `"object"`,
/// `"array"`, `"any"`) or an object `{ "type": <name>, "optional": bool }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

#[derive(Debug, Clone)]
struct FieldRule {
    field: String,
    expected: ExpectedType,
    optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedType {
    Number,
    String,
    Boolean,
    Object,
    Array,
    Any,
}

impl ExpectedType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "number" => Self::Number,
            "string" => Self::String,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            "any" => Self::Any,
            _ => return None,
        })
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

fn parse_rule(field: &str, rule: &Value) -> Option<FieldRule> {
    match rule {
        Value::String(type_name) => Some(FieldRule {
            field: field.to_owned(),
            expected: ExpectedType::parse(type_name)?,
            optional: false,
        }),
        Value::Object(spec) => {
            let type_name = spec.get("type")?.as_str()?;
            Some(FieldRule {
                field: field.to_owned(),
                expected: ExpectedType::parse(type_name)?,
                optional: spec
                    .get("optional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        _ => None,
    }
}

impl Validator for SchemaValidator {
    fn compile(&self, schema: &Value) -> Checker {
        let rules: Vec<FieldRule> = match schema {
            Value::Object(fields) => fields
                .iter()
                .filter_map(|(field, rule)| parse_rule(field, rule))
                .collect(),
            // Unknown schema shape: accept everything.
            _ => Vec::new(),
        };

        Arc::new(move |params: &Value| {
            let mut issues = Vec::new();
            for rule in &rules {
                match params.get(&rule.field) {
                    None | Some(Value::Null) => {
                        if !rule.optional {
                            issues.push(FieldIssue {
                                field: rule.field.clone(),
                                message: "required field is missing".to_owned(),
                            });
                        }
                    }
                    Some(value) => {
                        if !rule.expected.matches(value) {
                            issues.push(FieldIssue {
                                field: rule.field.clone(),
                                message: format!("expected type `{}`", rule.expected.name()),
                            });
                        }
                    }
                }
            }
            issues
        })
    }
}

/// Runs a compiled checker and converts its issues into a broker error.
pub fn check_params(checker: &Checker, action: &str, params: &Value) -> Result<(), BrokerError> {
    let issues = checker(params);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::Validation {
            action: action.to_owned(),
            data: Value::Array(issues.iter().map(FieldIssue::to_value).collect()),
        })
    }
}
