//! Document analysis: geometry, layers, effect masks and the manifest.
//!
//! The analyzer owns no state beyond its configuration and renderer; every
//! artifact it produces goes into the job's workspace.

pub mod classify;
pub mod document;
pub mod manifest;
pub mod mask;
pub mod quality;
pub mod render;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use crate::broadcast::job_progress::JobPhase;
use crate::error::AnalyzeError;
use crate::pipeline::{checkpoint, ProgressEvent, ProgressReporter};
use crate::queue::JobPayload;
use crate::sanitize;
use crate::storage::JobWorkspace;

pub use classify::{Classification, EffectTable, EffectType, Side};
pub use manifest::{Manifest, Materials};
pub use render::{PopplerRenderer, Renderer};

use manifest::{
    Layer, LayerEffect, ManifestParts, MaskMethod, ParsingMethod, SourceInfo, CONFIDENCE_EMPTY_MASK,
    CONFIDENCE_FALLBACK, CONFIDENCE_ISOLATED, CONFIDENCE_SUBSTITUTE,
};
use mask::BoundingBox;

pub const BASE_ASSET: &str = "base_front.png";
pub const MIN_DPI: u32 = 36;
pub const MAX_DPI: u32 = 1200;

/// Progress span covered by per-layer mask rendering.
const MASKS_START: u8 = 35;
const MASKS_END: u8 = 70;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Global switch; a job's own `enableLayerMode` can only narrow it.
    pub enable_layer_mode: bool,
    /// Isolated renders smaller than this are treated as unusable.
    pub min_mask_bytes: usize,
    pub effect_table: EffectTable,
    pub materials: Materials,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enable_layer_mode: true,
            min_mask_bytes: 512,
            effect_table: EffectTable::default(),
            materials: Materials::default(),
        }
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
    renderer: Arc<dyn Renderer>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig, renderer: Arc<dyn Renderer>) -> Self {
        Self { config, renderer }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyzes the document referenced by `payload`, writing masks and the
    /// base raster into `workspace`. The manifest itself is not persisted.
    pub fn analyze(
        &self,
        payload: &JobPayload,
        workspace: &JobWorkspace,
        progress: &dyn ProgressReporter,
    ) -> Result<Manifest, AnalyzeError> {
        let started = Instant::now();
        let source = payload.file_path.as_path();
        let _span = info_span!("analyzer", filename = %sanitize::redact_path(source)).entered();

        checkpoint(progress, ProgressEvent::phase(JobPhase::Parsing, "Parsing document"))?;
        let doc = {
            let _s = info_span!("analyzer.ingest").entered();
            document::inspect(source)?
        };

        checkpoint(progress, ProgressEvent::phase(
            JobPhase::Dimensions,
            format!("{:.1} x {:.1} mm", doc.width_mm, doc.height_mm),
        ))?;
        if !doc.has_valid_dimensions() {
            warn!("No usable page box; dimensions reported as zero");
        }

        let dpi = effective_dpi(payload.options.resolution);
        let layer_mode = self.config.enable_layer_mode && payload.options.enable_layer_mode;
        if payload.options.enable_vector_extraction {
            debug!("Vector extraction requested; die-cut vectors are not extracted");
        }

        let names: &[String] = if layer_mode { &doc.layer_names } else { &[] };
        checkpoint(progress, ProgressEvent::phase(
            JobPhase::Layers,
            format!("{} declared layer(s)", names.len()),
        ))?;

        let mut full_page = None;
        let (layers, method) = if names.is_empty() {
            let stem = Path::new(&payload.original_name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&payload.original_name);
            let layers = self.fallback_layers(stem, doc.width_mm, doc.height_mm, workspace)?;
            (layers, ParsingMethod::Filename)
        } else {
            let layers = self.ocg_layers(source, names, dpi, workspace, &mut full_page, progress)?;
            (layers, ParsingMethod::Ocg)
        };
        checkpoint(progress, ProgressEvent::at(
            JobPhase::Masks,
            MASKS_END,
            format!("{} layer(s) classified", layers.len()),
        ))?;

        checkpoint(progress, ProgressEvent::phase(JobPhase::BaseRaster, "Rendering base raster"))?;
        let base_ref = {
            let _s = info_span!("analyzer.base_raster", dpi).entered();
            let page = full_page_render(self.renderer.as_ref(), source, dpi, &mut full_page)?;
            workspace.write_asset(BASE_ASSET, page)?
        };

        checkpoint(progress, ProgressEvent::phase(JobPhase::Manifest, "Assembling manifest"))?;
        let manifest = Manifest::assemble(ManifestParts {
            source: SourceInfo {
                original_name: payload.original_name.clone(),
                file_size: payload.file_size,
            },
            width_mm: doc.width_mm,
            height_mm: doc.height_mm,
            page_count: doc.page_count,
            materials: self.config.materials.clone(),
            layers,
            base_ref,
            method,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        info!(
            method = ?manifest.parsing.method,
            layers = manifest.parsing.layer_count,
            effects = manifest.parsing.effect_count,
            confidence = manifest.parsing.confidence,
            "Analysis finished"
        );
        Ok(manifest)
    }

    fn ocg_layers(
        &self,
        source: &Path,
        names: &[String],
        dpi: u32,
        workspace: &JobWorkspace,
        full_page: &mut Option<Vec<u8>>,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Layer>, AnalyzeError> {
        let table = &self.config.effect_table;
        let classified: Vec<_> = names.iter().map(|n| (n, table.classify(n))).collect();
        let effect_total = classified.iter().filter(|(_, c)| c.is_some()).count();

        let mut layers = Vec::with_capacity(classified.len());
        let mut done = 0usize;
        for (index, (name, classification)) in classified.into_iter().enumerate() {
            let id = format!("layer-{}", index);
            let Some(c) = classification else {
                layers.push(Layer::plain(id, name.clone()));
                continue;
            };

            let _s = info_span!("analyzer.layer", layer = %name, effect = %c.effect).entered();
            match self.effect_layer(source, name, &c, index, dpi, workspace, full_page) {
                Ok(effect) => layers.push(Layer::with_effect(id, name.clone(), effect)),
                Err(e @ AnalyzeError::PersistenceFailure { .. }) => return Err(e),
                Err(e) => warn!("Skipping layer '{}': {}", name, e),
            }

            done += 1;
            let pct = MASKS_START as usize
                + (MASKS_END - MASKS_START) as usize * done / effect_total.max(1);
            checkpoint(progress, ProgressEvent::at(
                JobPhase::Masks,
                pct as u8,
                format!("Layer '{}' ({}/{})", name, done, effect_total),
            ))?;
        }
        Ok(layers)
    }

    #[allow(clippy::too_many_arguments)]
    fn effect_layer(
        &self,
        source: &Path,
        name: &str,
        c: &Classification,
        index: usize,
        dpi: u32,
        workspace: &JobWorkspace,
        full_page: &mut Option<Vec<u8>>,
    ) -> Result<LayerEffect, AnalyzeError> {
        let isolated = match self.renderer.render(source, Some(name), dpi) {
            Ok(bytes) if bytes.len() >= self.config.min_mask_bytes => Some(bytes),
            Ok(bytes) => {
                debug!(bytes = bytes.len(), "Isolated render too small");
                None
            }
            Err(e) => {
                debug!("Isolated render failed: {}", e);
                None
            }
        };

        let (png, method, confidence) = match isolated {
            Some(bytes) => (bytes, MaskMethod::Isolated, CONFIDENCE_ISOLATED),
            None => {
                let page = full_page_render(self.renderer.as_ref(), source, dpi, full_page)?;
                (
                    mask::post_process(page, c.effect)?,
                    MaskMethod::PostProcessed,
                    CONFIDENCE_SUBSTITUTE,
                )
            }
        };

        let bounds = mask::alpha_bounds(&png, dpi)?;
        let mask_name = format!("mask_{:02}_{}.png", index, c.effect.as_str().to_lowercase());
        let mask_ref = workspace.write_asset(&mask_name, &png)?;

        let (bounds, confidence, low_confidence) = match bounds {
            Some(b) => (b, confidence, false),
            None => {
                warn!("Mask for '{}' is empty", name);
                (BoundingBox::default(), CONFIDENCE_EMPTY_MASK, true)
            }
        };

        Ok(LayerEffect {
            effect_type: c.effect,
            subtype: c.subtype.clone(),
            side: c.side,
            mask_ref,
            bounds,
            confidence,
            low_confidence,
            method,
        })
    }

    /// Effects guessed from the filename, one per matched effect type, each
    /// with a placeholder mask over the centered half of the page.
    fn fallback_layers(
        &self,
        stem: &str,
        width_mm: f64,
        height_mm: f64,
        workspace: &JobWorkspace,
    ) -> Result<Vec<Layer>, AnalyzeError> {
        let found = self.config.effect_table.classify_all(stem);
        if found.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = found.len(), "Effects inferred from filename");

        let placeholder = mask::placeholder()?;
        found
            .into_iter()
            .enumerate()
            .map(|(index, c)| {
                let mask_name = format!("placeholder_{}.png", c.effect.as_str().to_lowercase());
                let mask_ref = workspace.write_asset(&mask_name, &placeholder)?;
                Ok(Layer::with_effect(
                    format!("fallback-{}", index),
                    stem.to_string(),
                    LayerEffect {
                        effect_type: c.effect,
                        subtype: c.subtype,
                        side: c.side,
                        mask_ref,
                        bounds: BoundingBox::centered_half(width_mm, height_mm),
                        confidence: CONFIDENCE_FALLBACK,
                        low_confidence: true,
                        method: MaskMethod::Placeholder,
                    },
                ))
            })
            .collect()
    }
}

fn effective_dpi(requested: u32) -> u32 {
    let dpi = requested.clamp(MIN_DPI, MAX_DPI);
    if dpi != requested {
        warn!(requested, used = dpi, "Resolution out of range");
    }
    dpi
}

/// Renders the full page once per analysis and reuses it.
fn full_page_render<'c>(
    renderer: &dyn Renderer,
    source: &Path,
    dpi: u32,
    cache: &'c mut Option<Vec<u8>>,
) -> Result<&'c [u8], AnalyzeError> {
    if cache.is_none() {
        *cache = Some(renderer.render(source, None, dpi)?);
    }
    Ok(cache.as_deref().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::pipeline::NoopProgress;
    use crate::storage::WorkArea;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use lopdf::{dictionary, Document, Object};
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Serves canned PNGs: `layers` for isolated renders by name, `page` for
    /// the full page.
    struct FakeRenderer {
        page: Vec<u8>,
        layers: Vec<(String, Vec<u8>)>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl Renderer for FakeRenderer {
        fn render(&self, _source: &Path, selector: Option<&str>, _dpi: u32) -> Result<Vec<u8>, RenderError> {
            self.calls.lock().unwrap().push(selector.map(String::from));
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

    fn png(w: u32, h: u32, opaque: bool) -> Vec<u8> {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            if opaque && x >= w / 4 && x < w / 2 && y >= h / 4 && y < h / 2 {
                Rgba([20, 20, 20, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn pdf(dir: &Path, name: &str, layers: &[&str]) -> PathBuf {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "TrimBox" => vec![0.into(), 0.into(), 255.118.into(), 155.906.into()],
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
        if !layers.is_empty() {
            let refs: Vec<Object> = layers
                .iter()
                .map(|n| {
                    doc.add_object(dictionary! { "Type" => "OCG", "Name" => Object::string_literal(*n) })
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
        let path = dir.join(name);
        doc.save(&path).unwrap();
        path
    }

    fn setup(
        name: &str,
        layers: &[&str],
        renderer: FakeRenderer,
    ) -> (tempfile::TempDir, Analyzer, Arc<FakeRenderer>, JobPayload, JobWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let path = pdf(dir.path(), name, layers);
        let payload = JobPayload::new(path, name, 100);
        let ws = WorkArea::new(dir.path().join("work")).job("job-1");
        ws.prepare().unwrap();
        let renderer = Arc::new(renderer);
        let analyzer = Analyzer::new(
            AnalyzerConfig {
                min_mask_bytes: 16,
                ..AnalyzerConfig::default()
            },
            renderer.clone(),
        );
        (dir, analyzer, renderer, payload, ws)
    }

    fn renderer(layers: Vec<(&str, Vec<u8>)>) -> FakeRenderer {
        FakeRenderer {
            page: png(40, 40, true),
            layers: layers.into_iter().map(|(n, b)| (n.to_string(), b)).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_trim_box_dimensions() {
        let (_dir, analyzer, _renderer, payload, ws) = setup("plain.pdf", &[], renderer(vec![]));
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();
        assert!((manifest.dimensions.width - 90.0).abs() < 0.01);
        assert!((manifest.dimensions.height - 55.0).abs() < 0.01);
        assert_eq!(manifest.parsing.page_count, 1);
    }

    #[test]
    fn test_no_layers_neutral_name() {
        let (_dir, analyzer, _renderer, payload, ws) = setup("plain.pdf", &[], renderer(vec![]));
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();
        assert!(manifest.layers.is_empty());
        assert_eq!(manifest.parsing.method, ParsingMethod::Filename);
        assert_eq!(manifest.parsing.confidence, 0.35);
        assert!(ws.root().join("assets").join(BASE_ASSET).is_file());
    }

    #[test]
    fn test_isolated_mask_layer() {
        let r = renderer(vec![("Gold Foil", png(40, 40, true))]);
        let (_dir, analyzer, _renderer, payload, ws) = setup("card.pdf", &["Artwork", "Gold Foil"], r);
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();

        assert_eq!(manifest.parsing.method, ParsingMethod::Ocg);
        assert_eq!(manifest.layers.len(), 2);
        assert!(manifest.layers[0].effect.is_none());
        let effect = manifest.layers[1].effect.as_ref().unwrap();
        assert_eq!(effect.effect_type, EffectType::Foil);
        assert_eq!(effect.method, MaskMethod::Isolated);
        assert_eq!(effect.confidence, CONFIDENCE_ISOLATED);
        assert!(!effect.bounds.is_empty());
        assert!(ws.root().join(&effect.mask_ref).is_file());
    }

    #[test]
    fn test_small_isolated_render_falls_back_to_post_processing() {
        let r = renderer(vec![("Spot UV", vec![0u8; 8])]);
        let (_dir, analyzer, _renderer, payload, ws) = setup("card.pdf", &["Spot UV"], r);
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();

        let effect = manifest.layers[0].effect.as_ref().unwrap();
        assert_eq!(effect.method, MaskMethod::PostProcessed);
        assert_eq!(effect.confidence, CONFIDENCE_SUBSTITUTE);
    }

    #[test]
    fn test_empty_mask_is_low_confidence() {
        let r = renderer(vec![("Emboss", png(40, 40, false))]);
        let (_dir, analyzer, _renderer, payload, ws) = setup("card.pdf", &["Emboss"], r);
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();

        let effect = manifest.layers[0].effect.as_ref().unwrap();
        assert!(effect.low_confidence);
        assert_eq!(effect.confidence, CONFIDENCE_EMPTY_MASK);
        assert!(effect.bounds.is_empty());
    }

    #[test]
    fn test_full_page_rendered_once() {
        let (_dir, analyzer, renderer, payload, ws) =
            setup("card.pdf", &["Foil", "Dieline"], renderer(vec![]));
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();

        let calls = renderer.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![Some("Foil".to_string()), None, Some("Dieline".to_string())]
        );
        assert_eq!(manifest.parsing.effect_count, 2);
        assert!(manifest.maps.contains_key(manifest::DIELINE_MAP));
    }

    #[test]
    fn test_filename_fallback() {
        let (_dir, analyzer, _renderer, payload, ws) = setup("gold-foil-card.pdf", &[], renderer(vec![]));
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();

        assert_eq!(manifest.layers.len(), 1);
        let effect = manifest.layers[0].effect.as_ref().unwrap();
        assert_eq!(effect.effect_type, EffectType::Foil);
        assert_eq!(effect.subtype, "gold");
        assert_eq!(effect.confidence, CONFIDENCE_FALLBACK);
        assert_eq!(effect.method, MaskMethod::Placeholder);
        assert!((effect.bounds.width - 45.0).abs() < 0.01);
        assert_eq!(manifest.parsing.confidence, 0.5);
    }

    #[test]
    fn test_layer_mode_disabled_uses_filename() {
        let r = renderer(vec![("Gold Foil", png(40, 40, true))]);
        let (_dir, analyzer, _renderer, mut payload, ws) = setup("plain.pdf", &["Gold Foil"], r);
        payload.options.enable_layer_mode = false;
        let manifest = analyzer.analyze(&payload, &ws, &NoopProgress).unwrap();
        assert_eq!(manifest.parsing.method, ParsingMethod::Filename);
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn test_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"GIF89a not a pdf").unwrap();
        let ws = WorkArea::new(dir.path()).job("j");
        let analyzer = Analyzer::new(AnalyzerConfig::default(), Arc::new(renderer(vec![])));
        let err = analyzer
            .analyze(&JobPayload::new(path, "fake.pdf", 16), &ws, &NoopProgress)
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::InvalidInput { .. }));
    }

    #[test]
    fn test_dpi_is_clamped() {
        assert_eq!(effective_dpi(10), MIN_DPI);
        assert_eq!(effective_dpi(300), 300);
        assert_eq!(effective_dpi(5000), MAX_DPI);
    }

    /// Cancels once `limit` checkpoints have been reported.
    struct CancelAfter {
        limit: usize,
        seen: Mutex<usize>,
    }

    impl ProgressReporter for CancelAfter {
        fn report(&self, _event: ProgressEvent) {
            *self.seen.lock().unwrap() += 1;
        }

        fn is_cancelled(&self) -> bool {
            *self.seen.lock().unwrap() >= self.limit
        }
    }

    #[test]
    fn test_cancelled_reporter_stops_before_rendering() {
        let r = renderer(vec![("Gold Foil", png(40, 40, true))]);
        let (_dir, analyzer, renderer, payload, ws) = setup("card.pdf", &["Gold Foil"], r);
        let progress = CancelAfter {
            limit: 2,
            seen: Mutex::new(0),
        };

        let err = analyzer.analyze(&payload, &ws, &progress).unwrap_err();
        assert!(matches!(err, AnalyzeError::Cancelled(_)));
        assert!(renderer.calls.lock().unwrap().is_empty());
        assert!(!ws.assets_dir().join(BASE_ASSET).exists());
    }
}
