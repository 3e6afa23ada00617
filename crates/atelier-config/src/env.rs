use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

/// Failure to expand a `{{ ... }}` placeholder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    /// The variable is unset and the placeholder has no default
    #[error("environment variable not found: `{name}` (line {line})")]
    MissingVariable { name: String, line: usize },
    /// The placeholder is not scoped with `env.`
    #[error("only variables scoped with 'env.' are supported: `{key}` (line {line})")]
    UnsupportedScope { key: String, line: usize },
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Group 1: the key (`env.NAME`), group 2: optional default("...")
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([a-zA-Z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
            .expect("must be valid regex")
    })
}

/// Expand `{{ env.VAR }}` and `{{ env.VAR | default("x") }}` in raw TOML
///
/// Runs on the text before deserialization so config structs hold plain
/// strings. Lines whose first non-blank character is `#` are copied as-is.
pub fn expand_env(input: &str) -> Result<String, ExpandError> {
    let mut output = String::with_capacity(input.len());

    for (index, line) in input.lines().enumerate() {
        if index > 0 {
            output.push('\n');
        }

        if line.trim_start().starts_with('#') {
            output.push_str(line);
        } else {
            output.push_str(&expand_line(line, index + 1)?);
        }
    }

    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}

fn expand_line(line: &str, line_number: usize) -> Result<String, ExpandError> {
    let mut result = String::with_capacity(line.len());
    let mut last_end = 0;

    for captures in placeholder().captures_iter(line) {
        let Some(whole) = captures.get(0) else {
            continue;
        };

        result.push_str(&line[last_end..whole.start()]);
        result.push_str(&resolve(&captures, line_number)?);
        last_end = whole.end();
    }

    result.push_str(&line[last_end..]);
    Ok(result)
}

fn resolve(captures: &Captures<'_>, line: usize) -> Result<String, ExpandError> {
    let key = captures.get(1).map_or("", |m| m.as_str());
    let default_value = captures.get(2).map(|m| m.as_str());

    let Some(name) = key.strip_prefix("env.").filter(|name| !name.is_empty() && !name.contains('.')) else {
        return Err(ExpandError::UnsupportedScope {
            key: key.to_owned(),
            line,
        });
    };

    match (std::env::var(name), default_value) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(default)) => Ok(default.to_owned()),
        (Err(_), None) => Err(ExpandError::MissingVariable {
            name: name.to_owned(),
            line,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_placeholders() {
        let input = "checkpoint = \"model.safetensors\"";
        assert_eq!(expand_env(input).unwrap(), input);
    }

    #[test]
    fn backend_url_from_env() {
        temp_env::with_var("ATELIER_TEST_URL", Some("http://gpu-box:8188"), || {
            let result = expand_env("url = \"{{ env.ATELIER_TEST_URL }}\"").unwrap();
            assert_eq!(result, "url = \"http://gpu-box:8188\"");
        });
    }

    #[test]
    fn several_placeholders_on_separate_lines() {
        let vars = [("ATELIER_CKPT", Some("dreamshaper.safetensors")), ("ATELIER_SAMPLER", Some("dpmpp_2m"))];
        temp_env::with_vars(vars, || {
            let result =
                expand_env("checkpoint = \"{{ env.ATELIER_CKPT }}\"\nsampler = \"{{ env.ATELIER_SAMPLER }}\"").unwrap();
            assert_eq!(result, "checkpoint = \"dreamshaper.safetensors\"\nsampler = \"dpmpp_2m\"");
        });
    }

    #[test]
    fn missing_variable_reports_name_and_line() {
        temp_env::with_var_unset("ATELIER_MISSING", || {
            let err = expand_env("[comfyui]\nurl = \"{{ env.ATELIER_MISSING }}\"").unwrap_err();
            assert_eq!(
                err,
                ExpandError::MissingVariable {
                    name: "ATELIER_MISSING".to_owned(),
                    line: 2,
                }
            );
        });
    }

    #[test]
    fn unsupported_scope() {
        let err = expand_env("url = \"{{ secrets.URL }}\"").unwrap_err();
        assert!(matches!(err, ExpandError::UnsupportedScope { ref key, .. } if key == "secrets.URL"));
    }

    #[test]
    fn comment_lines_are_not_expanded() {
        temp_env::with_var_unset("ATELIER_MISSING", || {
            let input = "  # url = \"{{ env.ATELIER_MISSING }}\"";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }

    #[test]
    fn default_applies_only_when_unset() {
        temp_env::with_var_unset("ATELIER_OPTIONAL", || {
            let result = expand_env("url = \"{{ env.ATELIER_OPTIONAL | default(\"\") }}\"").unwrap();
            assert_eq!(result, "url = \"\"");
        });

        temp_env::with_var("ATELIER_OPTIONAL", Some("http://set:8188"), || {
            let result = expand_env("url = \"{{ env.ATELIER_OPTIONAL | default(\"\") }}\"").unwrap();
            assert_eq!(result, "url = \"http://set:8188\"");
        });
    }

    #[test]
    fn trailing_newline_is_preserved() {
        assert_eq!(expand_env("steps = 6\n").unwrap(), "steps = 6\n");
    }
}
