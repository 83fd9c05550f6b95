//! Builders for test documents and renders.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use lopdf::{dictionary, Document, Object};

use printmap::analyzer::Renderer;
use printmap::error::RenderError;

/// 90 x 55 mm in PDF points.
pub const CARD_WIDTH_PT: f64 = 255.118;
pub const CARD_HEIGHT_PT: f64 = 155.906;

/// Builds a one-page PDF with a trim box and optional layers.
pub struct PdfBuilder {
    width_pt: f64,
    height_pt: f64,
    layers: Vec<String>,
}

impl PdfBuilder {
    pub fn card() -> Self {
        Self {
            width_pt: CARD_WIDTH_PT,
            height_pt: CARD_HEIGHT_PT,
            layers: Vec::new(),
        }
    }

    pub fn layer(mut self, name: &str) -> Self {
        self.layers.push(name.to_string());
        self
    }

    pub fn write(self, path: &Path) -> PathBuf {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "TrimBox" => vec![0.into(), 0.into(), (self.width_pt as f32).into(), (self.height_pt as f32).into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );

        let mut catalog = dictionary! { "Type" => "Catalog", "Pages" => pages_id };
        if !self.layers.is_empty() {
            let refs: Vec<Object> = self
                .layers
                .iter()
                .map(|n| {
                    doc.add_object(dictionary! { "Type" => "OCG", "Name" => Object::string_literal(n.as_str()) })
                        .into()
                })
                .collect();
            catalog.set(
                "OCProperties",
                dictionary! { "OCGs" => refs.clone(), "D" => dictionary! { "ON" => refs } },
            );
        }
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", catalog_id);
        doc.save(path).expect("Failed to write test PDF");
        path.to_path_buf()
    }
}

/// PNG with an opaque block in its upper-left quadrant when `opaque`.
pub fn png(w: u32, h: u32, opaque: bool) -> Vec<u8> {
    let img = RgbaImage::from_fn(w, h, |x, y| {
        if opaque && x >= w / 4 && x < w / 2 && y >= h / 4 && y < h / 2 {
            Rgba([30, 30, 30, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("Failed to encode test PNG");
    buf
}

/// Serves canned renders: the full page for `None`, a per-layer PNG for
/// known layer names. An optional delay simulates a slow render.
pub struct FakeRenderer {
    page: Vec<u8>,
    layers: Vec<(String, Vec<u8>)>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Option<String>>>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self {
            page: png(40, 40, true),
            layers: Vec::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_layer(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.layers.push((name.to_string(), bytes));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Renderer for FakeRenderer {
    fn render(&self, _source: &Path, selector: Option<&str>, _dpi: u32) -> Result<Vec<u8>, RenderError> {
        self.calls.lock().unwrap().push(selector.map(String::from));
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match selector {
            None => Ok(self.page.clone()),
            Some(name) => self
                .layers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| RenderError::UnknownLayer(name.to_string())),
        }
    }
}
