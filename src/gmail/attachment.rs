use std::fs;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// A file read fully into memory, ready to be attached to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = fs::read(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::from_bytes(filename, data))
    }

    pub fn from_bytes(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = guess_content_type(&filename);
        Attachment {
            filename,
            content_type,
            data,
        }
    }

    pub fn size_kb(&self) -> f64 {
        self.data.len() as f64 / 1024.0
    }
}

fn guess_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
