//! 文字识别适配层
//!
//! OCR 本身由外部引擎完成（默认调用 tesseract 命令行），这里只负责把
//! 图片交给引擎并区分两类结果：
//! - 没有识别到文字：返回空字符串，属于正常输入
//! - 引擎不可用或执行失败：返回错误，必须向上传递

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExtractionTarget, PipelineError, PipelineResult, Stage};
use crate::types::{FrameRef, SampledFrame, SlideImage};

/// 外部文字识别能力
pub trait TextRecognizer: Send + Sync {
    /// 识别图片中的文字；没有文字时返回空字符串
    fn recognize(&self, image: &Path) -> PipelineResult<String>;
}

/// 调用 tesseract 命令行的识别器
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    binary: PathBuf,
    language: Option<String>,
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: None,
        }
    }
}

impl TesseractRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// 识别语言，例如 `eng` 或 `chi_sim+eng`
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &Path) -> PipelineResult<String> {
        if !image.exists() {
            return Err(PipelineError::extraction(
                Stage::Extract,
                ExtractionTarget::Path(image.to_path_buf()),
                "图片不存在",
            ));
        }

        let mut command = Command::new(&self.binary);
        command.arg(image).arg("stdout");
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }

        let output = command.output().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => PipelineError::CapabilityUnavailable {
                capability: "tesseract",
                source: e,
            },
            _ => PipelineError::extraction(Stage::Extract, ExtractionTarget::Path(image.to_path_buf()), e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::extraction(
                Stage::Extract,
                ExtractionTarget::Path(image.to_path_buf()),
                format!("tesseract 退出码 {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// 对幻灯片和采样帧统一执行文字识别
pub struct ContentExtractor<'a> {
    recognizer: &'a dyn TextRecognizer,
    parallel: bool,
    cancel: CancellationToken,
}

impl<'a> ContentExtractor<'a> {
    pub fn new(recognizer: &'a dyn TextRecognizer) -> Self {
        Self {
            recognizer,
            parallel: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn extract_text(&self, image: &Path) -> PipelineResult<String> {
        self.recognizer.recognize(image)
    }

    /// 识别全部幻灯片页面，编号从 1 开始
    pub fn extract_slides(&self, pages: &[PathBuf]) -> PipelineResult<Vec<SlideImage>> {
        let start = Instant::now();
        let slides = self.map_ordered(pages, |position, page| {
            let slide_index = position + 1;
            let text = self.recognize_target(page, ExtractionTarget::Slide(slide_index))?;
            debug!("[文字识别] 幻灯片 {}: {} 个字符", slide_index, text.chars().count());
            Ok(SlideImage {
                slide_index,
                source_path: page.clone(),
                extracted_text: text,
            })
        })?;
        info!(
            "✅ [文字识别] {} 张幻灯片识别完成，耗时: {:.2}秒",
            slides.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(slides)
    }

    /// 识别全部采样帧，保持输入顺序
    pub fn extract_frames(&self, frames: Vec<FrameRef>) -> PipelineResult<Vec<SampledFrame>> {
        let start = Instant::now();
        let sampled = self.map_ordered(&frames, |_, frame| {
            let text = self.recognize_target(&frame.image_path, ExtractionTarget::Frame(frame.frame_index))?;
            Ok(SampledFrame::from_ref(frame.clone(), text))
        })?;
        info!(
            "✅ [文字识别] {} 个视频帧识别完成，耗时: {:.2}秒",
            sampled.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(sampled)
    }

    fn recognize_target(&self, image: &Path, target: ExtractionTarget) -> PipelineResult<String> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Stage::Extract });
        }
        self.recognizer.recognize(image).map_err(|e| match e {
            // 补上具体的幻灯片/帧编号
            PipelineError::Extraction { stage, message, .. } => PipelineError::Extraction { stage, target, message },
            other => other,
        })
    }

    fn map_ordered<T, R, F>(&self, items: &[T], f: F) -> PipelineResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> PipelineResult<R> + Sync,
    {
        if self.parallel {
            items.par_iter().enumerate().map(|(i, item)| f(i, item)).collect()
        } else {
            items.iter().enumerate().map(|(i, item)| f(i, item)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapRecognizer(HashMap<PathBuf, String>);

    impl TextRecognizer for MapRecognizer {
        fn recognize(&self, image: &Path) -> PipelineResult<String> {
            match self.0.get(image) {
                Some(text) => Ok(text.clone()),
                None => Err(PipelineError::extraction(
                    Stage::Extract,
                    ExtractionTarget::Path(image.to_path_buf()),
                    "engine crashed",
                )),
            }
        }
    }

    fn frame(index: u64) -> FrameRef {
        FrameRef {
            frame_index: index,
            timestamp_seconds: index as f64 / 10.0,
            image_path: PathBuf::from(format!("{:010}.jpg", index)),
        }
    }

    #[test]
    fn test_extract_slides_numbers_from_one() {
        let recognizer = MapRecognizer(HashMap::from([
            (PathBuf::from("1.jpg"), "intro".to_string()),
            (PathBuf::from("2.jpg"), String::new()),
        ]));
        let extractor = ContentExtractor::new(&recognizer);

        let slides = extractor
            .extract_slides(&[PathBuf::from("1.jpg"), PathBuf::from("2.jpg")])
            .unwrap();

        assert_eq!(slides[0].slide_index, 1);
        assert_eq!(slides[0].extracted_text, "intro");
        // 空文字是合法结果
        assert_eq!(slides[1].slide_index, 2);
        assert_eq!(slides[1].extracted_text, "");
    }

    #[test]
    fn test_extract_text_single_image() {
        let recognizer = MapRecognizer(HashMap::from([(PathBuf::from("a.jpg"), "hello world".to_string())]));
        let extractor = ContentExtractor::new(&recognizer);

        assert_eq!(extractor.extract_text(Path::new("a.jpg")).unwrap(), "hello world");
        assert!(matches!(
            extractor.extract_text(Path::new("missing.jpg")),
            Err(PipelineError::Extraction { .. })
        ));
    }

    #[test]
    fn test_extract_frames_preserves_order() {
        let recognizer = MapRecognizer(
            (0..20u64)
                .map(|i| (frame(i * 10).image_path, format!("frame {}", i)))
                .collect(),
        );
        let extractor = ContentExtractor::new(&recognizer).parallel(true);

        let frames = extractor.extract_frames((0..20u64).map(|i| frame(i * 10)).collect()).unwrap();

        let indices: Vec<u64> = frames.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, (0..20u64).map(|i| i * 10).collect::<Vec<_>>());
        assert_eq!(frames[3].extracted_text, "frame 3");
    }

    #[test]
    fn test_extraction_failure_names_frame() {
        let recognizer = MapRecognizer(HashMap::new());
        let extractor = ContentExtractor::new(&recognizer).parallel(false);

        let err = extractor.extract_frames(vec![frame(60)]).unwrap_err();
        match err {
            PipelineError::Extraction { target, .. } => assert_eq!(target, ExtractionTarget::Frame(60)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_tesseract_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("slide.jpg");
        std::fs::write(&image, b"jpg").unwrap();
        let recognizer = TesseractRecognizer::new().with_binary(dir.path().join("no-such-tesseract"));

        let err = recognizer.recognize(&image).unwrap_err();
        assert!(matches!(err, PipelineError::CapabilityUnavailable { capability: "tesseract", .. }));
    }

    #[test]
    fn test_cancelled_extraction_stops() {
        let recognizer = MapRecognizer(HashMap::from([(PathBuf::from("1.jpg"), "x".to_string())]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let extractor = ContentExtractor::new(&recognizer).with_cancellation(cancel);

        let err = extractor.extract_slides(&[PathBuf::from("1.jpg")]).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Extract }));
    }
}
