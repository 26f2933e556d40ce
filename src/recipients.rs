use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const INVALID_FORMAT_REASON: &str = "Invalid email format";

// Recipient list files are plain text, one address per line.
const ACCEPTED_EXTENSIONS: [&str; 2] = ["csv", "txt"];

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read recipient file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Recipient file '{path}' is not valid UTF-8 text")]
    NotText { path: String },
    #[error("Please upload a CSV or TXT file (got '{path}')")]
    UnsupportedFormat { path: String },
}

/// One candidate address from an imported list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub valid: bool,
    pub reason: Option<String>,
}

impl Recipient {
    pub fn from_line(line: &str) -> Self {
        let email = line.trim().to_string();
        if is_valid_email(&email) {
            Recipient {
                email,
                valid: true,
                reason: None,
            }
        } else {
            Recipient {
                email,
                valid: false,
                reason: Some(INVALID_FORMAT_REASON.to_string()),
            }
        }
    }
}

/// `local@domain.tld` shape: a single `@`, no whitespace, and a dot in the
/// domain with something on both sides of it.
pub fn is_valid_email(candidate: &str) -> bool {
    if candidate.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = candidate.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() {
        return false;
    }
    // Some dot must split the domain into two non-empty halves.
    domain
        .char_indices()
        .filter(|(_, c)| *c == '.')
        .any(|(i, _)| i > 0 && i + 1 < domain.len())
}

/// Parses line-delimited text into recipients, skipping blank lines.
pub fn parse_recipients(content: &str) -> Vec<Recipient> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(Recipient::from_line)
        .collect()
}

pub fn read_recipient_file(path: &Path) -> Result<Vec<Recipient>, ParseError> {
    let path_str = path.to_string_lossy().to_string();

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if !matches!(extension.as_deref(), Some(ext) if ACCEPTED_EXTENSIONS.contains(&ext)) {
        return Err(ParseError::UnsupportedFormat { path: path_str });
    }

    let bytes = fs::read(path).map_err(|e| ParseError::Io {
        path: path_str.clone(),
        source: e,
    })?;
    let content = String::from_utf8(bytes).map_err(|_| ParseError::NotText {
        path: path_str.clone(),
    })?;

    let recipients = parse_recipients(&content);
    info!(
        "Imported {} recipient line(s) from {}",
        recipients.len(),
        path_str
    );
    Ok(recipients)
}

/// Addresses that will actually be sent to, in import order.
pub fn valid_addresses(recipients: &[Recipient]) -> Vec<String> {
    recipients
        .iter()
        .filter(|r| r.valid)
        .map(|r| r.email.clone())
        .collect()
}

/// Writes the valid addresses back out in the newline-delimited list format.
pub fn write_recipient_list(path: &Path, recipients: &[Recipient]) -> std::io::Result<()> {
    let mut content = valid_addresses(recipients).join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    debug!("Writing recipient list to {}", path.display());
    fs::write(path, content)
}

/// Counts shown after an import, plus the rejected lines and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub warnings: Vec<(String, String)>,
}

impl From<&[Recipient]> for ImportSummary {
    fn from(recipients: &[Recipient]) -> Self {
        let warnings: Vec<(String, String)> = recipients
            .iter()
            .filter(|r| !r.valid)
            .map(|r| {
                (
                    r.email.clone(),
                    r.reason
                        .clone()
                        .unwrap_or_else(|| INVALID_FORMAT_REASON.to_string()),
                )
            })
            .collect();

        ImportSummary {
            total: recipients.len(),
            valid: recipients.len() - warnings.len(),
            invalid: warnings.len(),
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classifies_address_shapes() {
        assert!(is_valid_email("a@b.com"));
        assert!(is_valid_email("first.last+tag@mail.example.co.uk"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a@@b.com"));
        assert!(!is_valid_email("a@b@c.com"));
        assert!(!is_valid_email("@b.com"));
        assert!(!is_valid_email("a b@c.com"));
        assert!(!is_valid_email("a@.com"));
        assert!(!is_valid_email("a@com."));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn one_recipient_per_non_blank_line_in_order() {
        let content = "a@b.com\r\n\n   \nnot-an-email\nc@d.org\n";
        let recipients = parse_recipients(content);

        let emails: Vec<&str> = recipients.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["a@b.com", "not-an-email", "c@d.org"]);
        assert!(recipients[0].valid);
        assert!(!recipients[1].valid);
        assert_eq!(recipients[1].reason.as_deref(), Some(INVALID_FORMAT_REASON));
        assert!(recipients[2].valid);
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let recipients = parse_recipients("  a@b.com \t\n");
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].email, "a@b.com");
        assert!(recipients[0].valid);
    }

    #[test]
    fn summary_counts_and_warnings() {
        let recipients = parse_recipients("a@b.com\nbad\nc@d.org\na@b\n");
        let summary = ImportSummary::from(recipients.as_slice());

        assert_eq!(summary.total, 4);
        assert_eq!(summary.valid, 2);
        assert_eq!(summary.invalid, 2);
        assert_eq!(summary.warnings[0].0, "bad");
        assert_eq!(summary.warnings[1].0, "a@b");
    }

    #[test]
    fn reads_text_files_and_rejects_other_formats() {
        let dir = tempfile::tempdir().unwrap();

        let list = dir.path().join("list.csv");
        fs::write(&list, "a@b.com\nc@d.org\n").unwrap();
        let recipients = read_recipient_file(&list).unwrap();
        assert_eq!(recipients.len(), 2);

        let pdf = dir.path().join("list.pdf");
        fs::write(&pdf, "a@b.com").unwrap();
        assert!(matches!(
            read_recipient_file(&pdf),
            Err(ParseError::UnsupportedFormat { .. })
        ));

        let missing = dir.path().join("missing.txt");
        assert!(matches!(
            read_recipient_file(&missing),
            Err(ParseError::Io { .. })
        ));
    }

    #[test]
    fn binary_content_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[0xff, 0xfe, 0x00, 0x80]).unwrap();

        assert!(matches!(
            read_recipient_file(&path),
            Err(ParseError::NotText { .. })
        ));
    }

    #[test]
    fn written_list_contains_only_valid_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let recipients = parse_recipients("a@b.com\nbad\nc@d.org");

        write_recipient_list(&path, &recipients).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "a@b.com\nc@d.org\n");
        let reread = read_recipient_file(&path).unwrap();
        assert!(reread.iter().all(|r| r.valid));
    }
}
