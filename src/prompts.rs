//! Prompts for grounded answer generation.
//!
//! Every prompt lives here so the answer client's retry and error handling in
//! [`crate::answer`] never has to change when wording does. Callers override
//! the template via [`crate::config::QaConfig::prompt_template`]; the
//! constants below are used only when no override is provided.

use crate::error::DocQaError;
use std::path::Path;

/// Replaced with the rendered [`crate::context::PromptPayload`].
pub const CONTEXT_PLACEHOLDER: &str = "{{CONTEXT}}";

/// Replaced with the user's question.
pub const QUESTION_PLACEHOLDER: &str = "{{QUESTION}}";

/// System message sent ahead of the filled template.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You answer questions about a document collection. \
You only use the supplied context. If the context does not contain the answer, say so.";

/// Default user-turn template.
pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"Answer the question using ONLY the context below.

The context contains three kinds of fragments:
- [TEXT]  passages extracted from the documents
- [TABLE] tables rendered as Markdown
- [IMAGE] captions describing figures

Rules:
1. Ground every statement in the context and cite its (Source: ...) line.
2. Prefer tables for numeric answers; quote the exact cell values.
3. If fragments disagree, say so and cite both.
4. If the context is insufficient, answer "I don't know based on the provided documents."

<context>
{{CONTEXT}}
</context>

Question: {{QUESTION}}

Answer:"#;

/// Fill a template with the rendered context and the question.
///
/// Placeholders are resolved against the template only: a question or a
/// record that happens to contain `{{CONTEXT}}` is inserted verbatim.
pub fn fill_template(template: &str, context: &str, question: &str) -> String {
    template
        .split(CONTEXT_PLACEHOLDER)
        .map(|part| part.replace(QUESTION_PLACEHOLDER, question))
        .collect::<Vec<_>>()
        .join(context)
}

/// Read a template from disk and check it contains both placeholders.
pub async fn load_prompt_template(path: impl AsRef<Path>) -> Result<String, DocQaError> {
    let path = path.as_ref();
    let template = tokio::fs::read_to_string(path).await.map_err(|e| {
        DocQaError::InvalidConfig(format!(
            "failed to read prompt template {}: {e}",
            path.display()
        ))
    })?;
    crate::config::validate_template(&template)?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_template_has_both_placeholders() {
        assert!(DEFAULT_PROMPT_TEMPLATE.contains(CONTEXT_PLACEHOLDER));
        assert!(DEFAULT_PROMPT_TEMPLATE.contains(QUESTION_PLACEHOLDER));
    }

    #[test]
    fn fill_replaces_placeholders() {
        let out = fill_template("C={{CONTEXT}} Q={{QUESTION}}", "ctx", "why?");
        assert_eq!(out, "C=ctx Q=why?");
    }

    #[test]
    fn question_cannot_inject_context_placeholder() {
        let out = fill_template("{{QUESTION}}|{{CONTEXT}}", "ctx", "{{CONTEXT}}");
        assert_eq!(out, "{{CONTEXT}}|ctx");
    }

    #[test]
    fn context_is_not_rescanned_for_question() {
        let out = fill_template("{{CONTEXT}} / {{QUESTION}}", "see {{QUESTION}}", "q");
        assert_eq!(out, "see {{QUESTION}} / q");
    }

    #[tokio::test]
    async fn load_template_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "Docs:\n{{{{CONTEXT}}}}\nQ: {{{{QUESTION}}}}").unwrap();
        let t = load_prompt_template(tmp.path()).await.unwrap();
        assert!(t.contains("{{CONTEXT}}"));
    }

    #[tokio::test]
    async fn load_template_rejects_missing_placeholder() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "no placeholders here").unwrap();
        assert!(load_prompt_template(tmp.path()).await.is_err());
    }
}
