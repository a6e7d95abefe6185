//! CSV splitting: one content block per record, keyed by header name.

use std::path::Path;

use ::csv::{ReaderBuilder, StringRecord, Trim};

use super::{Blocks, ContentBlock, SplitError, SplitOptions};

pub fn split(path: &Path, options: &SplitOptions) -> Result<Blocks, SplitError> {
    let _span = tracing::info_span!("splitter.csv").entered();

    let file = std::fs::File::open(path).map_err(|e| SplitError::ReadDocument {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(file);

    let headers = reader.headers()?.clone();
    let columns = select_columns(&headers, options.selected_fields.as_deref())?;

    log::debug!(
        "Splitting CSV {} with {} of {} columns",
        path.display(),
        columns.len(),
        headers.len()
    );

    let blocks = reader.into_records().map(move |record| {
        let record = record?;
        Ok(ContentBlock::from_fields(columns.iter().map(|(idx, name)| {
            (name.clone(), record.get(*idx).unwrap_or("").to_string())
        })))
    });

    Ok(Box::new(blocks))
}

/// Resolves the columns to keep as `(index, name)` pairs in header order.
fn select_columns(
    headers: &StringRecord,
    selected: Option<&[String]>,
) -> Result<Vec<(usize, String)>, SplitError> {
    let all: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| !name.is_empty())
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let Some(selected) = selected else {
        return Ok(all);
    };

    for wanted in selected {
        if !all.iter().any(|(_, name)| name == wanted.trim()) {
            return Err(SplitError::UnknownField(wanted.trim().to_string()));
        }
    }

    Ok(all
        .into_iter()
        .filter(|(_, name)| selected.iter().any(|s| s.trim() == name))
        .collect())
}
