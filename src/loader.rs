use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
};

use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    walker::{DiscoveredFile, DocumentKind},
};

/// Extracted text of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Source identifier: the path relative to the input directory.
    pub source: String,
    pub text: String,
}

/// Extract the text of a single discovered file.
///
/// Text files must be valid UTF-8. Any read or parse failure is returned
/// as [`Error::Document`] naming the offending path.
pub fn load_document(file: &DiscoveredFile) -> Result<Document> {
    let text = match file.kind {
        DocumentKind::Text => std::fs::read_to_string(&file.absolute_path)
            .map_err(|e| Error::Document {
                path: file.relative_path.clone(),
                message: e.to_string(),
            })?,
        DocumentKind::Pdf => extract_pdf_text(&file.absolute_path)
            .map_err(|message| Error::Document {
                path: file.relative_path.clone(),
                message,
            })?,
    };

    tracing::debug!(
        source = %file.relative_path.display(),
        chars = text.chars().count(),
        "loaded document"
    );

    Ok(Document {
        source: file.relative_path.to_string_lossy().to_string(),
        text,
    })
}

/// Run the PDF extractor, turning its panics on malformed input (missing
/// fonts, text operators outside a font state) into ordinary errors.
fn extract_pdf_text(path: &Path) -> std::result::Result<String, String> {
    match catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text(path))) {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(panic) => {
            let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown error".to_string()
            };
            Err(format!("malformed PDF: {reason}"))
        }
    }
}

/// Load every discovered file, preserving discovery order.
///
/// Files are read in parallel; the first failure aborts the whole batch.
pub fn load_documents(files: &[DiscoveredFile]) -> Result<Vec<Document>> {
    files.par_iter().map(load_document).collect()
}

/// Build a one-page PDF whose page carries `resources` and draws `content`.
#[cfg(test)]
pub(crate) fn one_page_pdf(resources: &str, content: &str) -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources {resources} /Contents 4 0 R >>"
        ),
        format!(
            "<< /Length {} >>\nstream\n{content}\nendstream",
            content.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(
            format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes(),
        );
    }

    let xref = pdf.len();
    let size = objects.len() + 1;
    pdf.extend_from_slice(
        format!("xref\n0 {size}\n0000000000 65535 f \n").as_bytes(),
    );
    for offset in offsets {
        pdf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {size} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n"
        )
        .as_bytes(),
    );
    pdf
}

#[cfg(test)]
pub(crate) const PDF_FONT_RESOURCES: &str = "<< /Font << /F1 5 0 R >> >>";
