// Helper functions for extracting values from KDL nodes

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_int_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i64>> {
    node.get(name)
        .map(|v| to_i64(v, name))
        .transpose()
}

/// First positional argument as an integer. Errors if present but not an integer.
pub(crate) fn require_int_arg(node: &KdlNode) -> ConfigResult<i64> {
    let field = node.name().value();
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    to_i64(value, field)
}

/// First positional argument as a non-negative integer.
pub(crate) fn require_u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value();
    let value = require_int_arg(node)?;
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected a non-negative integer, got {value}"),
    })
}

pub(crate) fn require_float_arg(node: &KdlNode) -> ConfigResult<f64> {
    let field = node.name().value();
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a number, got {value}"),
        })
}

pub(crate) fn require_string_arg(node: &KdlNode) -> ConfigResult<String> {
    let field = node.name().value();
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn to_i64(value: &KdlValue, field: &str) -> ConfigResult<i64> {
    value
        .as_integer()
        .and_then(|i| i64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected an integer, got {value}"),
        })
}
