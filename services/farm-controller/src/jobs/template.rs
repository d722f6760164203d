use thiserror::Error;

use crate::api::Pod;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated action at offset {0}")]
    Unterminated(usize),

    #[error("unknown field {0:?}")]
    UnknownField(String),
}

/// Substitutes `{{ .Name }}`, `{{ .Namespace }}` and `{{ .PodIP }}` with the
/// pod's values.
pub fn render_command(command: &str, pod: &Pod) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unterminated(offset + start));
        };
        let value = match after[..end].trim() {
            ".Name" => pod.metadata.name.as_str(),
            ".Namespace" => pod.metadata.namespace.as_str(),
            ".PodIP" => pod.ip().unwrap_or_default(),
            other => return Err(TemplateError::UnknownField(other.to_string())),
        };
        out.push_str(value);
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}
