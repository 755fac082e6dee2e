use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

/// Project file extensions the renderer accepts.
pub const PROJECT_EXTENSIONS: &[&str] = &["moho", "anime", "anme"];

pub const MAX_QUALITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "JPEG")]
    Jpeg,
    #[serde(rename = "TGA")]
    Tga,
    #[serde(rename = "BMP")]
    Bmp,
    #[serde(rename = "PNG")]
    Png,
    #[serde(rename = "PSD")]
    Psd,
    #[serde(rename = "QT")]
    Qt,
    #[default]
    #[serde(rename = "MP4")]
    Mp4,
    #[serde(rename = "Animated GIF")]
    AnimatedGif,
    #[serde(rename = "M4V")]
    M4v,
    #[serde(rename = "AVI")]
    Avi,
    #[serde(rename = "ASF")]
    Asf,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 11] = [
        OutputFormat::Jpeg,
        OutputFormat::Tga,
        OutputFormat::Bmp,
        OutputFormat::Png,
        OutputFormat::Psd,
        OutputFormat::Qt,
        OutputFormat::Mp4,
        OutputFormat::AnimatedGif,
        OutputFormat::M4v,
        OutputFormat::Avi,
        OutputFormat::Asf,
    ];

    /// Name passed to the renderer's `-f` flag.
    pub fn cli_name(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "JPEG",
            OutputFormat::Tga => "TGA",
            OutputFormat::Bmp => "BMP",
            OutputFormat::Png => "PNG",
            OutputFormat::Psd => "PSD",
            OutputFormat::Qt => "QT",
            OutputFormat::Mp4 => "MP4",
            OutputFormat::AnimatedGif => "Animated GIF",
            OutputFormat::M4v => "M4V",
            OutputFormat::Avi => "AVI",
            OutputFormat::Asf => "ASF",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Tga => "tga",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Png => "png",
            OutputFormat::Psd => "psd",
            OutputFormat::Qt => "mov",
            OutputFormat::Mp4 => "mp4",
            OutputFormat::AnimatedGif => "gif",
            OutputFormat::M4v => "m4v",
            OutputFormat::Avi => "avi",
            OutputFormat::Asf => "asf",
        }
    }

    /// Image formats write one file per frame.
    pub fn is_frame_sequence(self) -> bool {
        matches!(
            self,
            OutputFormat::Jpeg
                | OutputFormat::Tga
                | OutputFormat::Bmp
                | OutputFormat::Png
                | OutputFormat::Psd
        )
    }

    /// Codec presets understood by the renderer for this container.
    pub fn presets(self) -> &'static [&'static str] {
        match self {
            OutputFormat::Mp4 => &["MP4 (MPEG4-AAC)", "MP4 (H.265-AAC)"],
            OutputFormat::Qt => &[
                "MOV (ProRes alpha-ALAC)",
                "MOV (PNG alpha-PCM)",
                "MOV (MJPEG-AAC)",
                "MOV (MPEG4-AAC)",
            ],
            OutputFormat::M4v => &["M4V (MPEG4-AAC)"],
            OutputFormat::Avi => &["AVI (PNG alpha-PCM)", "AVI (MJPEG-PCM)", "AVI (Raw-PCM)"],
            OutputFormat::Asf => &[
                "ASF (WMV-WMA)",
                "ASF (Raw-PCM)",
                "ASF (PNG alpha-PCM)",
                "ASF (MJPEG-PCM)",
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cli_name())
    }
}

impl FromStr for OutputFormat {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        OutputFormat::ALL
            .into_iter()
            .find(|f| {
                f.cli_name().eq_ignore_ascii_case(wanted) || f.extension().eq_ignore_ascii_case(wanted)
            })
            .or_else(|| match wanted.to_ascii_lowercase().as_str() {
                "gif" | "animated-gif" => Some(OutputFormat::AnimatedGif),
                "jpeg" => Some(OutputFormat::Jpeg),
                _ => None,
            })
            .ok_or_else(|| FarmError::Validation(format!("unknown output format '{}'", s)))
    }
}

/// Which layer compositions to render in one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerComp {
    All,
    Named(String),
}

impl LayerComp {
    pub fn cli_value(&self) -> &str {
        match self {
            LayerComp::All => "AllComps",
            LayerComp::Named(name) => name,
        }
    }
}

impl FromStr for LayerComp {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        if name.is_empty() {
            return Err(FarmError::Validation("empty layer comp name".to_string()));
        }
        if ["all", "allcomps", "alllayercomps"]
            .iter()
            .any(|a| name.eq_ignore_ascii_case(a))
        {
            Ok(LayerComp::All)
        } else {
            Ok(LayerComp::Named(name.to_string()))
        }
    }
}

/// Everything that controls one render. Immutable once a render attempt
/// has started; `None` on the tri-state flags leaves the renderer default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub format: OutputFormat,
    /// Codec preset, e.g. `MP4 (MPEG4-AAC)`.
    pub preset: Option<String>,
    /// Output folder override. Without it the renderer writes next to the project.
    pub output_dir: Option<PathBuf>,
    pub subfolder_per_project: bool,
    pub start_frame: Option<u32>,
    pub end_frame: Option<u32>,
    pub multithread: Option<bool>,
    pub half_size: Option<bool>,
    pub half_fps: Option<bool>,
    pub shape_fx: Option<bool>,
    pub layer_fx: Option<bool>,
    pub few_particles: Option<bool>,
    pub antialias: Option<bool>,
    pub extra_smooth: Option<bool>,
    pub premultiply: Option<bool>,
    pub ntsc_safe: Option<bool>,
    pub layer_comp: Option<LayerComp>,
    pub add_format_suffix: Option<bool>,
    pub add_layer_comp_suffix: Option<bool>,
    pub create_folder_for_layer_comps: Option<bool>,
    /// Renderer-specific codec index for movie formats.
    pub video_codec: Option<u32>,
    /// 0 (minimum) to 5 (lossless).
    pub quality: Option<u8>,
    /// 24 or 32 bits per pixel.
    pub depth: Option<u8>,
    pub verbose: bool,
    pub quiet: bool,
    pub log_file: Option<PathBuf>,
    /// Copy `Images/` next to the project before rendering.
    pub copy_images: bool,
    /// Hand the finished layer comps to the compositor.
    pub compose_layers: bool,
    pub reverse_layer_order: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Mp4,
            preset: Some("MP4 (MPEG4-AAC)".to_string()),
            output_dir: None,
            subfolder_per_project: false,
            start_frame: None,
            end_frame: None,
            multithread: None,
            half_size: None,
            half_fps: None,
            shape_fx: None,
            layer_fx: None,
            few_particles: None,
            antialias: None,
            extra_smooth: None,
            premultiply: None,
            ntsc_safe: None,
            layer_comp: None,
            add_format_suffix: None,
            add_layer_comp_suffix: None,
            create_folder_for_layer_comps: None,
            video_codec: None,
            quality: None,
            depth: None,
            verbose: true,
            quiet: false,
            log_file: None,
            copy_images: false,
            compose_layers: false,
            reverse_layer_order: false,
        }
    }
}

impl RenderSettings {
    /// Settings for a format, with its first preset (if any) selected.
    pub fn for_format(format: OutputFormat) -> Self {
        Self {
            format,
            preset: format.presets().first().map(|p| p.to_string()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(q) = self.quality {
            if q > MAX_QUALITY {
                return Err(FarmError::Validation(format!(
                    "quality must be 0-{}, got {}",
                    MAX_QUALITY, q
                )));
            }
        }
        if let Some(d) = self.depth {
            if d != 24 && d != 32 {
                return Err(FarmError::Validation(format!(
                    "pixel depth must be 24 or 32, got {}",
                    d
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start_frame, self.end_frame) {
            if start > end {
                return Err(FarmError::Validation(format!(
                    "start frame {} is after end frame {}",
                    start, end
                )));
            }
        }
        if let Some(preset) = &self.preset {
            if preset.trim().is_empty() {
                return Err(FarmError::Validation("empty codec preset".to_string()));
            }
        }
        if let Some(LayerComp::Named(name)) = &self.layer_comp {
            if name.trim().is_empty() {
                return Err(FarmError::Validation("empty layer comp name".to_string()));
            }
        }
        Ok(())
    }

    /// Number of frames one composition produces, when the range is explicit.
    pub fn expected_frames(&self) -> Option<u32> {
        match (self.start_frame, self.end_frame) {
            (Some(start), Some(end)) if end >= start => Some(end - start + 1),
            _ => None,
        }
    }

    /// Output file passed to `-o`, when an output folder is configured.
    pub fn resolve_output(&self, project: &Path) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        let stem = project
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "render".to_string());
        let base = if self.subfolder_per_project {
            dir.join(&stem)
        } else {
            dir.clone()
        };
        Some(base.join(format!("{}.{}", stem, self.format.extension())))
    }

    /// Folder the renderer writes into.
    pub fn output_folder(&self, project: &Path) -> PathBuf {
        match self.resolve_output(project) {
            Some(out) => out.parent().map(Path::to_path_buf).unwrap_or_default(),
            None => project.parent().map(Path::to_path_buf).unwrap_or_default(),
        }
    }
}

/// Reject project paths the renderer cannot open.
pub fn validate_project(project: &Path) -> Result<()> {
    let ext_ok = project
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| PROJECT_EXTENSIONS.iter().any(|p| p.eq_ignore_ascii_case(e)))
        .unwrap_or(false);
    if !ext_ok {
        return Err(FarmError::Validation(format!(
            "{} is not a project file (expected .{})",
            project.display(),
            PROJECT_EXTENSIONS.join(", .")
        )));
    }
    if !project.is_file() {
        return Err(FarmError::Validation(format!(
            "project file not found: {}",
            project.display()
        )));
    }
    Ok(())
}
