use std::{fmt, path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::error::ClientError;

/// An image picked for analysis.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.bytes.len())
            .finish()
    }
}

impl UploadFile {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image '{}'", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(file_name, mime_type, bytes))
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn validate(&self, max_bytes: u64) -> Result<(), ClientError> {
        if self.bytes.is_empty() {
            return Err(ClientError::InvalidUpload(format!(
                "{} is empty",
                self.file_name
            )));
        }
        if !self.mime_type.starts_with("image/") {
            return Err(ClientError::InvalidUpload(format!(
                "only image files are supported, got {} ({})",
                self.file_name, self.mime_type
            )));
        }
        if self.size_bytes() > max_bytes {
            return Err(ClientError::InvalidUpload(format!(
                "{} is {} but the limit is {}",
                self.file_name,
                format_size(self.size_bytes()),
                format_size(max_bytes)
            )));
        }
        Ok(())
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes < KB {
        format!("{bytes} bytes")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    }
}

/// Percentage of `sent` over `total`, clamped to 0..=100. An empty payload
/// counts as fully sent.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (sent.min(total) * 100 / total) as u8
}

/// Receives upload progress in percent as the transport consumes the body.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(u8) + Send + Sync>);

impl ProgressSink {
    pub fn new(report: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self(Arc::new(report))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8) {
        (self.0)(percent.min(100));
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink")
    }
}
