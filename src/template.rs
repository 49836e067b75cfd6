//! Rendering of `{{.key}}` placeholders against a string map.
//!
//! Manifest fields are rendered through this pass during scope roll-out.
//! A single left-to-right scan replaces each `{{.key}}` with the map value
//! for `key`; a missing key renders as `<no value>`. Anything between
//! braces that is not a `.`-prefixed name is an error.

use std::collections::BTreeMap;

use thiserror::Error;

/// Rendered in place of a placeholder whose key is absent from the map.
const MISSING: &str = "<no value>";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template: unclosed placeholder")]
    Unclosed,
    #[error("invalid template: bad placeholder {0:?}")]
    BadPlaceholder(String),
}

/// Render `input`, replacing each `{{.key}}` with its value from `vars`.
pub fn render(input: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unclosed);
        };
        let token = after[..end].trim();
        match token.strip_prefix('.') {
            Some(key) if !key.is_empty() => {
                out.push_str(vars.get(key).map(String::as_str).unwrap_or(MISSING));
            }
            _ => return Err(TemplateError::BadPlaceholder(token.to_string())),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render every value of `map` in place.
pub fn render_map(
    map: &mut BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
) -> Result<(), TemplateError> {
    for value in map.values_mut() {
        *value = render(value, vars)?;
    }
    Ok(())
}

/// Render every element of `slice` in place.
pub fn render_slice(
    slice: &mut [String],
    vars: &BTreeMap<String, String>,
) -> Result<(), TemplateError> {
    for value in slice.iter_mut() {
        *value = render(value, vars)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_placeholders() {
        let v = vars(&[("name", "web"), ("port", "8080")]);
        let out = render("{{.name}}:{{.port}}", &v).unwrap();
        assert_eq!(out, "web:8080");
    }

    #[test]
    fn plain_text_passes_through() {
        let v = vars(&[]);
        assert_eq!(render("no markers here", &v).unwrap(), "no markers here");
        assert_eq!(render("", &v).unwrap(), "");
    }

    #[test]
    fn missing_key_renders_sentinel() {
        let v = vars(&[]);
        assert_eq!(render("{{.absent}}", &v).unwrap(), "<no value>");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let v = vars(&[("x", "1")]);
        assert_eq!(render("{{ .x }}", &v).unwrap(), "1");
    }

    #[test]
    fn unclosed_placeholder_errors() {
        let v = vars(&[("x", "1")]);
        assert!(matches!(
            render("{{.x", &v),
            Err(TemplateError::Unclosed)
        ));
    }

    #[test]
    fn bad_placeholder_errors() {
        let v = vars(&[]);
        assert!(matches!(
            render("{{x}}", &v),
            Err(TemplateError::BadPlaceholder(_))
        ));
        assert!(matches!(
            render("{{.}}", &v),
            Err(TemplateError::BadPlaceholder(_))
        ));
    }

    #[test]
    fn renders_maps_and_slices_in_place() {
        let v = vars(&[("dir", "/tmp")]);
        let mut m = vars(&[("HOME", "{{.dir}}/home")]);
        render_map(&mut m, &v).unwrap();
        assert_eq!(m["HOME"], "/tmp/home");

        let mut s = vec!["{{.dir}}/a".to_string(), "plain".to_string()];
        render_slice(&mut s, &v).unwrap();
        assert_eq!(s, vec!["/tmp/a", "plain"]);
    }
}
