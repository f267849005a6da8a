//! Environment variable interpolation for configuration files.
//!
//! Interpolation happens on the raw YAML text before parsing, so
//! references can appear anywhere in the document, including keys.
//! Supported syntax:
//! - `$VAR` or `${VAR}` - substitute the variable's value, error if unset
//! - `${VAR:-default}` - use the default if VAR is unset or empty
//! - `${VAR-default}` - use the default only if VAR is unset
//! - `$$` - a literal `$`

use std::env;
use std::sync::LazyLock;

use regex::Regex;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped dollar
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # braced name (group 1)
            (?:
                (:?-)                  # default operator, :- or - (group 2)
                ([^}]*)                # default value (group 3)
            )?
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # unbraced name (group 4)
        ",
    )
    .expect("Invalid regex pattern")
});

/// Result of interpolating environment variables into config text.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The text with all resolvable references substituted.
    pub text: String,
    /// Human-readable errors for unresolvable references.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Substitute environment variable references in the given text.
///
/// Errors are collected rather than short-circuited so a single pass
/// reports every bad reference in the file. Unresolvable references are
/// left in place.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = caps.get(0).map(|m| m.as_str()).unwrap_or_default();

            if full_match == "$$" {
                return "$".to_string();
            }

            let name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let operator = caps.get(2).map(|m| m.as_str());
            let default = caps.get(3).map(|m| m.as_str());

            match env::var(name) {
                Ok(value) => {
                    // A value spanning lines would corrupt the YAML
                    // around it.
                    if value.contains('\n') || value.contains('\r') {
                        errors.push(format!(
                            "Environment variable '{name}' contains newlines, which is not allowed"
                        ));
                        return full_match.to_string();
                    }

                    if value.is_empty() && operator == Some(":-") {
                        return default.unwrap_or_default().to_string();
                    }

                    value
                }
                Err(_) => match default {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("Environment variable '{name}' is not set"));
                        full_match.to_string()
                    }
                },
            }
        })
        .to_string();

    InterpolationResult { text, errors }
}
