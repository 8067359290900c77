//! Minimal placeholder substitution for notification commands.
//!
//! Placeholders look like `{{name}}`. Surrounding whitespace, a leading dot and letter case are
//! ignored, so `{{ .Name }}` renders the same field.
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Unclosed placeholder at byte {0}")]
    Unclosed(usize),
    #[error("Unknown template field `{0}`")]
    UnknownField(String),
}

pub(crate) fn render<'a>(
    template: &str,
    lookup: impl Fn(&str) -> Option<&'a str>,
) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let offset = template.len() - rest.len() + start;
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unclosed(offset))?;

        let field = after[..end].trim();
        let key = field.strip_prefix('.').unwrap_or(field).to_ascii_lowercase();
        let value = lookup(&key).ok_or_else(|| TemplateError::UnknownField(field.to_owned()))?;
        rendered.push_str(value);

        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod test {
    use super::*;

    fn lookup(key: &str) -> Option<&'static str> {
        match key {
            "name" => Some("Import ~/Music"),
            "status" => Some("completed"),
            _ => None,
        }
    }

    #[test]
    fn renders_fields() {
        assert_eq!(
            render("notify-send '{{name}}' {{ .Status }}", lookup).unwrap(),
            "notify-send 'Import ~/Music' completed"
        );
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(render("echo done", lookup).unwrap(), "echo done");
        assert_eq!(render("", lookup).unwrap(), "");
        assert_eq!(render("a } b }}", lookup).unwrap(), "a } b }}");
    }

    #[test]
    fn unknown_field_errors() {
        assert_eq!(
            render("echo {{.Owner}}", lookup),
            Err(TemplateError::UnknownField(".Owner".to_owned()))
        );
    }

    #[test]
    fn unclosed_placeholder_errors() {
        assert_eq!(
            render("echo {{name}} {{status", lookup),
            Err(TemplateError::Unclosed(14))
        );
    }
}
