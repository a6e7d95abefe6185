//! Document splitting: turns an uploaded file into an ordered, lazy sequence
//! of content blocks.
//!
//! The set of formats is closed. [`FileSplitter`] picks the variant once from
//! the file extension; callers that need a different source (tests, other
//! storage) implement [`DocumentSplitter`] themselves.

pub mod csv;
pub mod pdf;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use thiserror::Error;

use crate::job::{DocumentMode, JobConfig};

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read document '{path}': {source}")]
    ReadDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse CSV: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("Selected field '{0}' is not a column of the document")]
    UnknownField(String),

    #[error("Failed to process PDF: {0}")]
    Pdf(String),
}

/// A binary blob carried by a content block, e.g. a rendered page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// One row, page group or record extracted from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentBlock {
    pub fields: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
}

impl ContentBlock {
    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            attachments: Vec::new(),
        }
    }

    /// True when no field carries text and nothing is attached.
    pub fn is_blank(&self) -> bool {
        self.attachments.is_empty() && self.fields.values().all(|v| v.trim().is_empty())
    }
}

/// Options derived from the job configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOptions {
    /// Pages per block for paged formats.
    pub work_unit: u32,
    pub selected_fields: Option<Vec<String>>,
    pub mode: DocumentMode,
    /// Resolution for rendered page images.
    pub dpi: u32,
}

pub const DEFAULT_DPI: u32 = 150;

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            work_unit: 1,
            selected_fields: None,
            mode: DocumentMode::Text,
            dpi: DEFAULT_DPI,
        }
    }
}

impl SplitOptions {
    pub fn from_config(config: &JobConfig, dpi: u32) -> Self {
        Self {
            work_unit: config.work_unit(),
            selected_fields: config.selected_fields.clone(),
            mode: config.document_mode(),
            dpi,
        }
    }
}

/// Lazy, one-shot block sequence.
pub type Blocks = Box<dyn Iterator<Item = Result<ContentBlock, SplitError>>>;

pub trait DocumentSplitter: Send + Sync {
    /// Opens `path` and returns its blocks in document order.
    fn split(&self, path: &Path, options: &SplitOptions) -> Result<Blocks, SplitError>;

    /// Number of blocks the document yields.
    fn count_blocks(&self, path: &Path, options: &SplitOptions) -> Result<usize, SplitError> {
        let mut count = 0;
        for block in self.split(path, options)? {
            block?;
            count += 1;
        }
        Ok(count)
    }

    /// The first `limit` blocks.
    fn preview(
        &self,
        path: &Path,
        options: &SplitOptions,
        limit: usize,
    ) -> Result<Vec<ContentBlock>, SplitError> {
        self.split(path, options)?.take(limit).collect()
    }
}

/// Formats with a built-in splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Csv,
    Pdf,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(DocumentFormat::Csv),
            "pdf" => Some(DocumentFormat::Pdf),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, SplitError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext).ok_or_else(|| SplitError::UnsupportedFormat(ext.to_string()))
    }
}

/// Splitter for files on local disk, dispatching on extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSplitter;

impl DocumentSplitter for FileSplitter {
    fn split(&self, path: &Path, options: &SplitOptions) -> Result<Blocks, SplitError> {
        match DocumentFormat::from_path(path)? {
            DocumentFormat::Csv => csv::split(path, options),
            DocumentFormat::Pdf => pdf::split(path, options),
        }
    }
}
