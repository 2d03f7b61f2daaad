use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::RawOptionMap;

/// Parse a duration string like "500ms" or "10s".
/// On failure, pushes an error and returns a zero duration.
pub fn parse_duration(path: &str, value: &str, errors: &mut Vec<ConfigError>) -> Duration {
    match value.parse::<humantime::Duration>() {
        Ok(d) => d.into(),
        Err(e) => {
            errors.push(ConfigError::InvalidField {
                path: path.to_owned(),
                message: format!("invalid duration '{value}': {e}"),
            });
            Duration::ZERO
        }
    }
}

/// Parse an inclusive port range written as `"start-end"`.
pub fn parse_port_range(
    path: &str,
    value: &str,
    errors: &mut Vec<ConfigError>,
) -> Option<(u16, u16)> {
    let parsed = value
        .split_once('-')
        .and_then(|(a, b)| Some((a.trim().parse::<u16>().ok()?, b.trim().parse::<u16>().ok()?)));
    match parsed {
        Some((start, end)) if start > 0 && start <= end => Some((start, end)),
        _ => {
            errors.push(ConfigError::InvalidField {
                path: path.to_owned(),
                message: format!("invalid port range '{value}', expected start-end"),
            });
            None
        }
    }
}

/// Flatten HCL option values into command-line values.
///
/// Strings and numbers become the value, `true` becomes a bare flag and
/// `false` drops the option.
pub fn parse_options(
    path: &str,
    raw: &RawOptionMap,
    errors: &mut Vec<ConfigError>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in raw {
        match value {
            hcl::Value::String(s) => {
                out.insert(name.clone(), s.clone());
            }
            hcl::Value::Number(n) => {
                out.insert(name.clone(), n.to_string());
            }
            hcl::Value::Bool(true) => {
                out.insert(name.clone(), String::new());
            }
            hcl::Value::Bool(false) => {}
            other => errors.push(ConfigError::InvalidField {
                path: format!("{path}.{name}"),
                message: format!("expected a string, number or bool, got {other:?}"),
            }),
        }
    }
    out
}
