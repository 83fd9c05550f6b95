//! Reading page geometry and optional-content layer names out of a PDF.

use std::path::Path;

use lopdf::{Dictionary, Document, Object};
use tracing::debug;

use crate::error::AnalyzeError;

/// How far into the file the `%PDF-` marker may appear.
const SIGNATURE_WINDOW: usize = 1024;
const SIGNATURE: &[u8] = b"%PDF-";

/// Boxes in order of preference: the tightest defined box wins.
const PAGE_BOXES: [&[u8]; 3] = [b"TrimBox", b"CropBox", b"MediaBox"];

pub const MM_PER_INCH: f64 = 25.4;
const POINTS_PER_INCH: f64 = 72.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentInfo {
    pub width_mm: f64,
    pub height_mm: f64,
    pub page_count: usize,
    /// Which page box the dimensions came from, `None` if no box was usable.
    pub page_box: Option<&'static str>,
    pub layer_names: Vec<String>,
}

impl DocumentInfo {
    pub fn has_valid_dimensions(&self) -> bool {
        self.width_mm > 0.0 && self.height_mm > 0.0
    }
}

pub fn has_pdf_signature(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SIGNATURE_WINDOW)];
    window.windows(SIGNATURE.len()).any(|w| w == SIGNATURE)
}

/// Loads `path` and extracts its geometry and declared layers.
pub fn inspect(path: &Path) -> Result<DocumentInfo, AnalyzeError> {
    let invalid = |reason: String| AnalyzeError::InvalidInput {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| invalid(format!("unreadable: {}", e)))?;
    if !has_pdf_signature(&bytes) {
        return Err(invalid("missing PDF signature".to_string()));
    }
    let doc = Document::load_mem(&bytes).map_err(|e| invalid(format!("failed to load PDF: {}", e)))?;

    let page_count = doc.get_pages().len();
    if page_count == 0 {
        return Err(invalid("document has no pages".to_string()));
    }

    let (width_mm, height_mm, page_box) = match first_page_size(&doc) {
        Some((w, h, name)) => (points_to_mm(w), points_to_mm(h), Some(name)),
        None => (0.0, 0.0, None),
    };
    let layer_names = layer_names(&doc);
    debug!(
        page_count,
        width_mm,
        height_mm,
        layers = layer_names.len(),
        "Document inspected"
    );

    Ok(DocumentInfo {
        width_mm,
        height_mm,
        page_count,
        page_box,
        layer_names,
    })
}

pub fn points_to_mm(pt: f64) -> f64 {
    pt * MM_PER_INCH / POINTS_PER_INCH
}

/// Size in points of the first page, from the first non-degenerate box in
/// preference order. Boxes inherited through the page tree count.
fn first_page_size(doc: &Document) -> Option<(f64, f64, &'static str)> {
    let page_id = *doc.get_pages().values().next()?;
    let page = dict_of(doc, doc.get_object(page_id).ok()?)?;

    for key in PAGE_BOXES {
        let Some(rect) = inherited(doc, page, key) else {
            continue;
        };
        if let Some((w, h)) = rect_size(doc, rect) {
            if w > 0.0 && h > 0.0 {
                return Some((w, h, box_name(key)));
            }
        }
        debug!(page_box = box_name(key), "Degenerate page box skipped");
    }
    None
}

fn box_name(key: &[u8]) -> &'static str {
    match key {
        b"TrimBox" => "TrimBox",
        b"CropBox" => "CropBox",
        _ => "MediaBox",
    }
}

/// Looks `key` up on the page, then on its ancestors.
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut node = page;
    // Bounded walk; malformed trees may loop.
    for _ in 0..32 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        node = dict_of(doc, node.get(b"Parent").ok()?)?;
    }
    None
}

fn rect_size(doc: &Document, rect: &Object) -> Option<(f64, f64)> {
    let Object::Array(items) = resolve(doc, rect) else {
        return None;
    };
    if items.len() != 4 {
        return None;
    }
    let mut n = [0.0f64; 4];
    for (slot, item) in n.iter_mut().zip(items) {
        *slot = number(resolve(doc, item))?;
    }
    Some(((n[2] - n[0]).abs(), (n[3] - n[1]).abs()))
}

/// Names of the optional-content groups in `/OCProperties /OCGs`, in
/// declaration order. Unnamed groups are skipped.
pub fn layer_names(doc: &Document) -> Vec<String> {
    ocgs(doc)
        .into_iter()
        .filter_map(|(_, name)| name)
        .filter(|name| !name.trim().is_empty())
        .collect()
}

/// Each declared OCG with its object id (when it is a reference) and
/// decoded name.
pub(crate) fn ocgs(doc: &Document) -> Vec<(Option<lopdf::ObjectId>, Option<String>)> {
    let Some(props) = oc_properties(doc) else {
        return Vec::new();
    };
    let Some(Object::Array(groups)) = props.get(b"OCGs").ok().map(|o| resolve(doc, o)) else {
        return Vec::new();
    };

    groups
        .iter()
        .map(|group| {
            let id = match group {
                Object::Reference(id) => Some(*id),
                _ => None,
            };
            let name = dict_of(doc, group)
                .and_then(|d| d.get(b"Name").ok())
                .and_then(|n| text_of(resolve(doc, n)));
            (id, name)
        })
        .collect()
}

fn oc_properties(doc: &Document) -> Option<&Dictionary> {
    let catalog = dict_of(doc, doc.trailer.get(b"Root").ok()?)?;
    dict_of(doc, catalog.get(b"OCProperties").ok()?)
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

pub(crate) fn dict_of<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj) {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Decodes a PDF text string: UTF-16BE behind a byte-order mark, UTF-8
/// behind its BOM, PDFDocEncoding (treated as Latin-1) otherwise.
pub(crate) fn text_of(obj: &Object) -> Option<String> {
    let bytes = match obj {
        Object::String(bytes, _) => bytes.as_slice(),
        Object::Name(bytes) => bytes.as_slice(),
        _ => return None,
    };
    Some(decode_text(bytes))
}

fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
        return char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    bytes.iter().map(|&b| b as char).collect()
}
