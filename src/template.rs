use std::fs;
use std::path::Path;
use tera::{Context, Error as TeraError, Tera};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template file '{path}': {source}")]
    ReadError {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse template '{name}': {source}")]
    ParseError { name: String, source: TeraError },
    #[error("Failed to render template: {0}")]
    RenderError(#[from] TeraError),
    #[error("Template format error: Missing 'Subject:' line or '---' separator")]
    FormatError,
}

/// Values a subject or body template can refer to.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContext<'a> {
    /// Empty for bulk messages, which have many recipients.
    pub recipient_email: &'a str,
    pub sender_name: &'a str,
    pub sender_email: &'a str,
    pub campaign_name: &'a str,
}

/// A compiled subject + HTML body pair.
pub struct EmailTemplate {
    pub subject_template: String,
    pub body_template: String,
    tera: Tera,
    template_name: String,
}

impl std::fmt::Debug for EmailTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailTemplate")
            .field("name", &self.template_name)
            .field("subject_template", &self.subject_template)
            .finish_non_exhaustive()
    }
}

// Each template owns its registry, so the two parts have fixed names.
const SUBJECT_PART: &str = "subject";
const BODY_PART: &str = "body";

/// Splits a saved composer file into `(subject, body)`.
///
/// The file is a `Subject: ...` line, a `---` line, then the HTML body kept
/// exactly as written, blank lines included.
fn split_template_file(content: &str) -> Result<(&str, &str), TemplateError> {
    let content = content.trim_start_matches('\u{feff}');
    let (subject_line, rest) = content.split_once('\n').ok_or(TemplateError::FormatError)?;
    let (separator, body) = rest.split_once('\n').unwrap_or((rest, ""));

    let subject = subject_line
        .trim_end_matches('\r')
        .strip_prefix("Subject:")
        .ok_or(TemplateError::FormatError)?;
    if separator.trim() != "---" {
        return Err(TemplateError::FormatError);
    }
    Ok((subject.trim(), body))
}

impl EmailTemplate {
    /// Loads a template the composer can prefill from; the file stem names it
    /// in errors.
    pub fn load(template_path: &Path) -> Result<Self, TemplateError> {
        let content =
            fs::read_to_string(template_path).map_err(|source| TemplateError::ReadError {
                path: template_path.display().to_string(),
                source,
            })?;
        let (subject, body) = split_template_file(&content)?;
        let name = template_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "template".to_string());
        Self::from_content(subject, body, &name)
    }

    /// Compiles the composer's subject and body.
    pub fn from_content(subject: &str, body: &str, name: &str) -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        tera.add_raw_templates([(SUBJECT_PART, subject), (BODY_PART, body)])
            .map_err(|source| TemplateError::ParseError {
                name: name.to_string(),
                source,
            })?;

        Ok(EmailTemplate {
            subject_template: subject.to_string(),
            body_template: body.to_string(),
            tera,
            template_name: name.to_string(),
        })
    }

    /// Renders `(subject, html_body)`.
    pub fn render(&self, values: &TemplateContext<'_>) -> Result<(String, String), TemplateError> {
        let mut context = Context::new();
        context.insert("recipient_email", values.recipient_email);
        context.insert("sender_name", values.sender_name);
        context.insert("sender_email", values.sender_email);
        context.insert("campaign_name", values.campaign_name);

        let subject = self.tera.render(SUBJECT_PART, &context)?;
        let body = self.tera.render(BODY_PART, &context)?;
        Ok((subject, body))
    }
}
