//! 相似度打分
//!
//! 主路径比较 OCR 文字（TF-IDF + 余弦），旧路径直接比较图像
//! （SSIM 或关键点匹配）。所有打分结果都落在 [0, 1]。

pub mod image;
pub mod text;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ::image::{DynamicImage, GrayImage};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{SampledFrame, SlideImage};

pub use self::image::{ssim, KeypointMatcher, DEFAULT_RATIO_THRESH};
pub use self::text::score_text;

/// 文字路径的接受阈值（相对最高分）
pub const TEXT_ACCEPT_THRESHOLD: f64 = 0.95;
/// 图像路径的接受阈值（相对最高分）
pub const IMAGE_ACCEPT_THRESHOLD: f64 = 0.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Text,
    Ssim,
    Keypoints,
}

impl MatchMode {
    pub fn is_image(&self) -> bool {
        !matches!(self, MatchMode::Text)
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMode::Text => "text",
            MatchMode::Ssim => "ssim",
            MatchMode::Keypoints => "keypoints",
        })
    }
}

impl FromStr for MatchMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "ocr" => Ok(MatchMode::Text),
            "ssim" => Ok(MatchMode::Ssim),
            "keypoints" | "sift" => Ok(MatchMode::Keypoints),
            other => Err(PipelineError::invalid_argument(format!("未知的匹配方式: {}", other))),
        }
    }
}

/// 幻灯片与采样帧之间的打分器
pub trait Scorer: Send + Sync {
    /// 相对最高分的接受比例
    fn acceptance_threshold(&self) -> f64;

    /// 打分前的准备工作（例如预先加载图像）
    fn prepare(&mut self, _slides: &[SlideImage], _frames: &[SampledFrame]) -> PipelineResult<()> {
        Ok(())
    }

    /// 返回 [0, 1] 的相似度
    fn score(&self, slide: &SlideImage, frame: &SampledFrame) -> PipelineResult<f64>;
}

/// 比较 OCR 文字
#[derive(Debug, Clone)]
pub struct TextScorer {
    threshold: f64,
}

impl TextScorer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for TextScorer {
    fn default() -> Self {
        Self::new(TEXT_ACCEPT_THRESHOLD)
    }
}

impl Scorer for TextScorer {
    fn acceptance_threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, slide: &SlideImage, frame: &SampledFrame) -> PipelineResult<f64> {
        Ok(score_text(&slide.extracted_text, &frame.extracted_text))
    }
}

#[derive(Debug, Clone)]
pub enum ImageMethod {
    Ssim,
    Keypoints(KeypointMatcher),
}

/// 直接比较图像（旧路径）
#[derive(Debug, Clone)]
pub struct ImageScorer {
    method: ImageMethod,
    threshold: f64,
    prepared: HashMap<PathBuf, GrayImage>,
}

impl ImageScorer {
    pub fn new(method: ImageMethod, threshold: f64) -> Self {
        Self {
            method,
            threshold,
            prepared: HashMap::new(),
        }
    }

    fn load(&mut self, path: &Path) -> PipelineResult<()> {
        if self.prepared.contains_key(path) {
            return Ok(());
        }
        let image = ::image::open(path)
            .map_err(|e| PipelineError::image(format!("读取图像 {}", path.display()), e))?;
        self.prepared.insert(path.to_path_buf(), self::image::prepare(&image));
        Ok(())
    }

    fn prepared(&self, path: &Path) -> PipelineResult<&GrayImage> {
        self.prepared.get(path).ok_or_else(|| {
            PipelineError::invalid_argument(format!("图像未加载: {}", path.display()))
        })
    }
}

impl Scorer for ImageScorer {
    fn acceptance_threshold(&self) -> f64 {
        self.threshold
    }

    fn prepare(&mut self, slides: &[SlideImage], frames: &[SampledFrame]) -> PipelineResult<()> {
        for slide in slides {
            self.load(&slide.source_path)?;
        }
        for frame in frames {
            self.load(&frame.image_path)?;
        }
        Ok(())
    }

    fn score(&self, slide: &SlideImage, frame: &SampledFrame) -> PipelineResult<f64> {
        let a = self.prepared(&slide.source_path)?;
        let b = self.prepared(&frame.image_path)?;
        compare_prepared(a, b, &self.method)
    }
}

fn compare_prepared(a: &GrayImage, b: &GrayImage, method: &ImageMethod) -> PipelineResult<f64> {
    let raw = match method {
        ImageMethod::Ssim => ssim(a, b)?,
        ImageMethod::Keypoints(matcher) => matcher.score(a, b)?,
    };
    Ok(raw.clamp(0.0, 1.0))
}

/// 直接比较两张任意尺寸的图像（先缩放到统一尺寸）
pub fn score_images(a: &DynamicImage, b: &DynamicImage, method: &ImageMethod) -> PipelineResult<f64> {
    if a.width() == 0 || a.height() == 0 || b.width() == 0 || b.height() == 0 {
        return Err(PipelineError::invalid_argument("图像为空"));
    }
    compare_prepared(&self::image::prepare(a), &self::image::prepare(b), method)
}
