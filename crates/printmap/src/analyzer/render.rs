//! Rasterization behind a narrow capability trait.
//!
//! The analyzer only ever asks for "page one of this document, optionally
//! with only this layer visible, at this resolution, as PNG bytes". The
//! production implementation shells out to poppler's `pdftocairo`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use lopdf::{Dictionary, Document, Object};
use tracing::{debug, warn};

use crate::error::RenderError;

use super::document::ocgs;

const TOOL: &str = "pdftocairo";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Tail of the tool's diagnostics kept in a `ToolFailed` error.
const STDERR_TAIL: usize = 2048;

pub trait Renderer: Send + Sync {
    /// Renders the first page of `source` to PNG. With a `selector`, only the
    /// optional-content layer of that name is visible.
    fn render(&self, source: &Path, selector: Option<&str>, dpi: u32) -> Result<Vec<u8>, RenderError>;
}

pub struct PopplerRenderer {
    tool: PathBuf,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl PopplerRenderer {
    pub fn new(scratch_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tool: PathBuf::from(TOOL),
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }

    /// Uses `tool` instead of `pdftocairo` from `PATH`.
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    fn tool_name(&self) -> String {
        self.tool.display().to_string()
    }

    /// Runs the tool with its stderr going to `log`, which a chatty run can
    /// fill without blocking on a pipe nobody reads.
    fn run(&self, input: &Path, output_prefix: &Path, log: &Path, dpi: u32) -> Result<(), RenderError> {
        let stderr = std::fs::File::create(log)?;
        let mut child = Command::new(&self.tool)
            .args(["-png", "-transp", "-singlefile", "-f", "1", "-l", "1", "-r"])
            .arg(dpi.to_string())
            .arg(input)
            .arg(output_prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| RenderError::Spawn {
                tool: self.tool_name(),
                source: e,
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!("Failed to kill timed out {}: {}", self.tool_name(), e);
                }
                let _ = child.wait();
                return Err(RenderError::Timeout {
                    tool: self.tool_name(),
                    secs: self.timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let output = std::fs::read(log).unwrap_or_default();
            let tail = &output[output.len().saturating_sub(STDERR_TAIL)..];
            return Err(RenderError::ToolFailed {
                tool: self.tool_name(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(tail).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Renderer for PopplerRenderer {
    fn render(&self, source: &Path, selector: Option<&str>, dpi: u32) -> Result<Vec<u8>, RenderError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let stem = format!("render_{}", uuid::Uuid::new_v4());
        let output_prefix = self.scratch_dir.join(&stem);
        let output = self.scratch_dir.join(format!("{}.png", stem));
        let log = self.scratch_dir.join(format!("{}.log", stem));

        let isolated = match selector {
            Some(name) => {
                let path = self.scratch_dir.join(format!("{}.pdf", stem));
                write_isolated_copy(source, name, &path)?;
                Some(path)
            }
            None => None,
        };
        let input = isolated.as_deref().unwrap_or(source);

        debug!(selector = selector.unwrap_or("<page>"), dpi, "Rendering");
        let result = self
            .run(input, &output_prefix, &log, dpi)
            .and_then(|()| std::fs::read(&output).map_err(RenderError::from));

        for path in isolated.iter().chain([&output, &log]) {
            let _ = std::fs::remove_file(path);
        }
        result
    }
}

/// Writes a copy of `source` whose default optional-content configuration
/// shows only the group named `layer`.
pub fn write_isolated_copy(source: &Path, layer: &str, dest: &Path) -> Result<(), RenderError> {
    let mut doc = Document::load(source).map_err(|e| RenderError::Prepare(e.to_string()))?;
    isolate_layer(&mut doc, layer)?;
    doc.save(dest).map_err(|e| RenderError::Prepare(e.to_string()))?;
    Ok(())
}

/// Rewrites `/OCProperties /D` so that only `layer` is on.
pub fn isolate_layer(doc: &mut Document, layer: &str) -> Result<(), RenderError> {
    let groups = ocgs(doc);
    let mut on = Vec::new();
    let mut off = Vec::new();
    for (id, name) in groups {
        let Some(id) = id else { continue };
        if name.as_deref() == Some(layer) {
            on.push(Object::Reference(id));
        } else {
            off.push(Object::Reference(id));
        }
    }
    if on.is_empty() {
        return Err(RenderError::UnknownLayer(layer.to_string()));
    }

    let mut config = Dictionary::new();
    config.set("BaseState", Object::Name(b"OFF".to_vec()));
    config.set("ON", Object::Array(on));
    config.set("OFF", Object::Array(off));

    let root = match doc.trailer.get(b"Root") {
        Ok(Object::Reference(id)) => *id,
        _ => return Err(RenderError::Prepare("catalog is not a reference".to_string())),
    };
    let props_ref = {
        let catalog = match doc.get_object(root) {
            Ok(Object::Dictionary(d)) => d,
            _ => return Err(RenderError::Prepare("catalog missing".to_string())),
        };
        match catalog.get(b"OCProperties") {
            Ok(Object::Reference(id)) => Some(*id),
            Ok(_) => None,
            Err(_) => return Err(RenderError::Prepare("no optional content".to_string())),
        }
    };

    let target = match props_ref {
        Some(id) => doc.get_object_mut(id),
        None => doc.get_object_mut(root).and_then(|catalog| match catalog {
            Object::Dictionary(d) => d.get_mut(b"OCProperties"),
            other => Ok(other),
        }),
    };
    match target {
        Ok(Object::Dictionary(props)) => {
            props.set("D", Object::Dictionary(config));
            props.remove(b"Configs");
            Ok(())
        }
        _ => Err(RenderError::Prepare("malformed optional content properties".to_string())),
    }
}
