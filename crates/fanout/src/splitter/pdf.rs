//! PDF splitting: pages grouped `work_unit` at a time.
//!
//! In text mode each block carries the extracted text of its pages. In image
//! mode each page is rendered to PNG with `pdftoppm` (poppler-utils) and
//! attached to the block.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::{Attachment, Blocks, ContentBlock, SplitError, SplitOptions};
use crate::job::DocumentMode;

pub fn split(path: &Path, options: &SplitOptions) -> Result<Blocks, SplitError> {
    let _span = tracing::info_span!("splitter.pdf").entered();

    let bytes = std::fs::read(path).map_err(|e| SplitError::ReadDocument {
        path: path.to_path_buf(),
        source: e,
    })?;
    let doc = lopdf::Document::load_mem(&bytes)
        .map_err(|e| SplitError::Pdf(format!("Failed to parse {}: {}", path.display(), e)))?;

    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    let chunks: Vec<Vec<u32>> = pages
        .chunks(options.work_unit.max(1) as usize)
        .map(<[u32]>::to_vec)
        .collect();

    log::debug!(
        "Splitting PDF {} into {} blocks of up to {} pages",
        path.display(),
        chunks.len(),
        options.work_unit
    );

    let mode = options.mode;
    let dpi = options.dpi;
    let source = path.to_path_buf();
    let blocks = chunks.into_iter().map(move |chunk| match mode {
        DocumentMode::Text => text_block(&doc, &chunk),
        DocumentMode::Image => image_block(&source, &chunk, dpi),
    });

    Ok(Box::new(blocks))
}

fn text_block(doc: &lopdf::Document, pages: &[u32]) -> Result<ContentBlock, SplitError> {
    let mut text = String::new();
    for page in pages {
        match doc.extract_text(&[*page]) {
            Ok(page_text) => {
                text.push_str(&page_text);
                text.push('\n');
            }
            Err(e) => log::warn!("Failed to extract text from page {}: {}", page, e),
        }
    }
    Ok(ContentBlock::from_fields([("text", text)]))
}

fn image_block(path: &Path, pages: &[u32], dpi: u32) -> Result<ContentBlock, SplitError> {
    let mut block = ContentBlock::default();
    for page in pages {
        let png = render_page_to_png(path, *page, dpi)?;
        block.attachments.push(Attachment::new("image/png", png));
    }
    Ok(block)
}

fn render_page_to_png(pdf_path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, SplitError> {
    let output_prefix: PathBuf =
        std::env::temp_dir().join(format!("fanout_page_{}", uuid::Uuid::new_v4()));

    let output = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg(pdf_path)
        .arg(&output_prefix)
        .output()
        .map_err(|e| {
            SplitError::Pdf(format!(
                "Failed to run pdftoppm: {}. Make sure poppler-utils is installed.",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(SplitError::Pdf(format!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    // pdftoppm zero-pads the page suffix depending on the page count.
    let prefix = output_prefix.display();
    let candidates = [
        format!("{}-{}.png", prefix, page),
        format!("{}-{:02}.png", prefix, page),
        format!("{}-{:03}.png", prefix, page),
    ];
    let image_path = candidates
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .ok_or_else(|| SplitError::Pdf("Failed to find rendered page image".to_string()))?;

    let data = std::fs::read(image_path)
        .map_err(|e| SplitError::Pdf(format!("Failed to read rendered image: {}", e)))?;
    let _ = std::fs::remove_file(image_path);

    Ok(data)
}
