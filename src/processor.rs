use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alignment::{order_violations, AlignmentEngine};
use crate::audio_extractor::FfmpegClipExtractor;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::ocr::{ContentExtractor, TesseractRecognizer, TextRecognizer};
use crate::rasterizer::{ExistingPagesRasterizer, PdftoppmRasterizer, Rasterizer, DEFAULT_RENDER_DPI};
use crate::sampler::{FrameSampler, FrameSource, FrameStore};
use crate::segments::{SegmentBuilder, SubtitleAudioExtractor};
use crate::similarity::{
    ImageMethod, ImageScorer, KeypointMatcher, MatchMode, Scorer, TextScorer, DEFAULT_RATIO_THRESH,
    IMAGE_ACCEPT_THRESHOLD, TEXT_ACCEPT_THRESHOLD,
};
use crate::storage::StorageLayout;
use crate::types::{AlignmentMetadata, SampledFrame, SlideRecord};
use crate::webhook::call_webhook;

/// 对齐配置
#[derive(Debug, Clone)]
pub struct AlignConfig {
    /// 存储根目录，其下按 <user>/<project> 划分
    pub storage_root: PathBuf,
    /// 抽帧间隔（帧）
    pub sampling_interval: u64,
    /// 已存在的帧文件是否重新写入
    pub overwrite_frames: bool,
    pub match_mode: MatchMode,
    /// 文字匹配的接受阈值（相对最高分）
    pub text_threshold: f64,
    /// 图像匹配的接受阈值（相对最高分）
    pub image_threshold: f64,
    /// 关键点匹配的比值检验阈值
    pub ratio_thresh: f64,
    pub symmetric_match: bool,
    /// 候选帧数量上限（None 表示使用全部采样帧）
    pub candidate_budget: Option<usize>,
    /// PDF 渲染分辨率
    pub render_dpi: u32,
    /// 文字识别与打分是否并行
    pub parallel: bool,
    /// 整体超时（秒）
    pub timeout_secs: Option<u64>,
    /// tesseract 识别语言
    pub ocr_language: Option<String>,
    /// Webhook URL（处理完成后回调）
    pub webhook_url: Option<String>,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl AlignConfig {
    /// 当前匹配方式使用的接受阈值
    pub fn acceptance_threshold(&self) -> f64 {
        if self.match_mode.is_image() {
            self.image_threshold
        } else {
            self.text_threshold
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for (name, value) in [("text_threshold", self.text_threshold), ("image_threshold", self.image_threshold)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(PipelineError::invalid_argument(format!("{} 必须在 (0, 1] 之间: {}", name, value)));
            }
        }
        if !(0.0..=1.0).contains(&self.ratio_thresh) {
            return Err(PipelineError::invalid_argument(format!(
                "ratio_thresh 必须在 [0, 1] 之间: {}",
                self.ratio_thresh
            )));
        }
        if self.sampling_interval == 0 {
            return Err(PipelineError::invalid_argument("采样间隔必须大于 0"));
        }
        if self.candidate_budget == Some(0) {
            return Err(PipelineError::invalid_argument("候选帧预算必须大于 0"));
        }
        if self.render_dpi == 0 {
            return Err(PipelineError::invalid_argument("渲染分辨率必须大于 0"));
        }
        if self.timeout_secs == Some(0) {
            return Err(PipelineError::invalid_argument("超时时间必须大于 0"));
        }
        Ok(())
    }
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            sampling_interval: 60,
            overwrite_frames: false,
            match_mode: MatchMode::Text,
            text_threshold: TEXT_ACCEPT_THRESHOLD,
            image_threshold: IMAGE_ACCEPT_THRESHOLD,
            ratio_thresh: DEFAULT_RATIO_THRESH,
            symmetric_match: true,
            candidate_budget: None,
            render_dpi: DEFAULT_RENDER_DPI,
            parallel: true,
            timeout_secs: None,
            ocr_language: None,
            webhook_url: None,
            log_level: "info".to_string(),
        }
    }
}

/// 一次对齐请求：文档、视频和存储命名空间
#[derive(Debug, Clone)]
pub struct AlignmentRequest {
    pub document: PathBuf,
    pub video: PathBuf,
    pub user_id: String,
    pub project_id: String,
}

/// 注入流水线的外部能力
#[derive(Clone)]
pub struct Capabilities {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub frame_source: Arc<dyn FrameSource>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub clips: Arc<dyn SubtitleAudioExtractor>,
}

impl Capabilities {
    /// 基于本机工具的默认能力：pdftoppm、FFmpeg、tesseract
    ///
    /// `pages_ready` 为 true 时跳过渲染，直接使用 `pdf_pages/` 中的页面。
    pub fn system(config: &AlignConfig, pages_ready: bool) -> PipelineResult<Self> {
        let rasterizer: Arc<dyn Rasterizer> = if pages_ready {
            Arc::new(ExistingPagesRasterizer)
        } else {
            Arc::new(PdftoppmRasterizer::new(config.render_dpi))
        };

        let mut recognizer = TesseractRecognizer::new();
        if let Some(language) = &config.ocr_language {
            recognizer = recognizer.with_language(language.clone());
        }

        Ok(Self {
            rasterizer,
            frame_source: system_frame_source()?,
            recognizer: Arc::new(recognizer),
            clips: Arc::new(FfmpegClipExtractor::new(std::env::temp_dir().join("slide-align"))),
        })
    }
}

/// 默认帧源（需要启用 `ffmpeg` 特性）
#[cfg(feature = "ffmpeg")]
pub fn system_frame_source() -> PipelineResult<Arc<dyn FrameSource>> {
    Ok(Arc::new(crate::video_processor::FfmpegFrameSource::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
pub fn system_frame_source() -> PipelineResult<Arc<dyn FrameSource>> {
    Err(PipelineError::CapabilityUnavailable {
        capability: "ffmpeg",
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "编译时未启用 ffmpeg 特性"),
    })
}

/// 对齐结果
#[derive(Debug, Clone)]
pub struct AlignmentOutput {
    /// 按幻灯片编号排列的记录
    pub records: Vec<SlideRecord>,
    pub metadata: AlignmentMetadata,
    /// slides.json 路径
    pub metadata_path: PathBuf,
}

/// 根据配置构造打分器
pub fn build_scorer(config: &AlignConfig) -> PipelineResult<Box<dyn Scorer>> {
    let scorer: Box<dyn Scorer> = match config.match_mode {
        MatchMode::Text => Box::new(TextScorer::new(config.text_threshold)),
        MatchMode::Ssim => Box::new(ImageScorer::new(ImageMethod::Ssim, config.image_threshold)),
        MatchMode::Keypoints => {
            let matcher = KeypointMatcher::new(config.ratio_thresh)?.symmetric(config.symmetric_match);
            Box::new(ImageScorer::new(ImageMethod::Keypoints(matcher), config.image_threshold))
        }
    };
    Ok(scorer)
}

/// 把幻灯片对齐到讲课视频
///
/// 阻塞部分在 `spawn_blocking` 中执行；配置了超时时，超时后触发取消并返回
/// [`PipelineError::Timeout`]。完成后写入 `slides.json`，并按需调用 webhook。
pub async fn align_slides_to_video(
    request: AlignmentRequest,
    config: &AlignConfig,
    capabilities: &Capabilities,
    cancel: CancellationToken,
) -> PipelineResult<AlignmentOutput> {
    config.validate()?;

    let task = {
        let config = config.clone();
        let capabilities = capabilities.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || run_pipeline(&request, &config, &capabilities, &cancel))
    };

    let joined = match config.timeout_secs {
        Some(seconds) => match tokio::time::timeout(Duration::from_secs(seconds), task).await {
            Ok(joined) => joined,
            Err(_) => {
                // 通知仍在运行的阶段尽快退出
                cancel.cancel();
                error!("❌ [幻灯片对齐] 处理超时（{} 秒），已取消", seconds);
                return Err(PipelineError::Timeout { seconds });
            }
        },
        None => task.await,
    };
    let output = joined.map_err(|e| PipelineError::TaskFailed { message: e.to_string() })??;

    // 调用 webhook 回调（如果配置了）
    if let Some(webhook_url) = &config.webhook_url {
        if let Err(e) = call_webhook(webhook_url, &output.metadata).await {
            warn!("⚠️  [幻灯片对齐] Webhook 回调失败: {:#}", e);
        }
    }

    Ok(output)
}

/// 同步执行完整流水线
pub fn run_pipeline(
    request: &AlignmentRequest,
    config: &AlignConfig,
    capabilities: &Capabilities,
    cancel: &CancellationToken,
) -> PipelineResult<AlignmentOutput> {
    let total_start = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    info!("🎬 [幻灯片对齐] 开始处理 (run {})", run_id);
    info!("  • 文档: {}", request.document.display());
    info!("  • 视频: {}", request.video.display());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let layout = StorageLayout::new(&config.storage_root, &request.user_id, &request.project_id)?;
    if !request.document.is_file() {
        return Err(PipelineError::precondition(
            Stage::Rasterize,
            format!("文档文件不存在: {}", request.document.display()),
        ));
    }
    if !request.video.is_file() {
        return Err(PipelineError::precondition(
            Stage::Sample,
            format!("视频文件不存在: {}", request.video.display()),
        ));
    }
    layout.ensure_dirs()?;

    // 1. 文档光栅化
    checkpoint(cancel, Stage::Rasterize)?;
    let pages = capabilities
        .rasterizer
        .rasterize(&request.document, &layout.pages_dir())
        .map_err(log_stage_error)?;

    // 2. 视频抽帧
    checkpoint(cancel, Stage::Sample)?;
    let sampler = FrameSampler::new(
        capabilities.frame_source.as_ref(),
        FrameStore::new(layout.frames_dir(), config.overwrite_frames),
        config.sampling_interval,
    )
    .with_cancellation(cancel.clone());
    let report = sampler.sample(&request.video).map_err(log_stage_error)?;
    let frame_refs: Vec<_> = sampler.frames(&report).collect();
    info!("  • 视频时长: {:.2}秒，帧率: {:.2} fps", report.video_info.duration_seconds, report.video_info.fps);

    // 3. 文字识别
    checkpoint(cancel, Stage::Extract)?;
    let extractor = ContentExtractor::new(capabilities.recognizer.as_ref())
        .parallel(config.parallel)
        .with_cancellation(cancel.clone());
    let slides = extractor.extract_slides(&pages).map_err(log_stage_error)?;
    let frames: Vec<SampledFrame> = if config.match_mode.is_image() {
        // 图像匹配不需要帧上的文字
        frame_refs
            .into_iter()
            .map(|frame| SampledFrame::from_ref(frame, String::new()))
            .collect()
    } else {
        extractor.extract_frames(frame_refs).map_err(log_stage_error)?
    };

    // 4. 对齐
    checkpoint(cancel, Stage::Align)?;
    let mut scorer = build_scorer(config)?;
    scorer.prepare(&slides, &frames)?;
    let results = AlignmentEngine::new(scorer.as_ref())
        .with_candidate_budget(config.candidate_budget)
        .parallel(config.parallel)
        .with_cancellation(cancel.clone())
        .align(&slides, &frames)
        .map_err(log_stage_error)?;

    // 5. 分段
    checkpoint(cancel, Stage::Segment)?;
    let segments = SegmentBuilder::new(capabilities.clips.as_ref(), &layout)
        .with_cancellation(cancel.clone())
        .build(&request.video, &results, report.video_info.duration_seconds)
        .map_err(log_stage_error)?;

    let records: Vec<SlideRecord> = slides
        .iter()
        .zip(&results)
        .zip(&segments)
        .map(|((slide, result), segment)| SlideRecord::assemble(slide, result, segment))
        .collect();

    // 6. 写入元数据
    checkpoint(cancel, Stage::Report)?;
    let metadata = AlignmentMetadata {
        run_id,
        document: request.document.to_string_lossy().to_string(),
        video: request.video.to_string_lossy().to_string(),
        video_info: report.video_info,
        sampling_interval: config.sampling_interval,
        sampled_frame_count: frames.len(),
        match_mode: config.match_mode.to_string(),
        slide_count: records.len(),
        order_violations: order_violations(&results),
        elapsed_seconds: total_start.elapsed().as_secs_f64(),
        slides: records.clone(),
    };
    let metadata_path = layout.metadata_path();
    write_metadata(&metadata_path, &metadata)?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "🎉 [幻灯片对齐] 处理完成，{} 张幻灯片，总耗时: {:.2}秒",
        records.len(),
        total_start.elapsed().as_secs_f64()
    );

    Ok(AlignmentOutput {
        records,
        metadata,
        metadata_path,
    })
}

fn write_metadata(path: &Path, metadata: &AlignmentMetadata) -> PipelineResult<()> {
    let metadata_json = serde_json::to_string_pretty(metadata).map_err(|source| PipelineError::Json {
        context: "slides.json",
        source,
    })?;
    std::fs::write(path, metadata_json).map_err(|e| PipelineError::io(format!("写入 {}", path.display()), e))?;
    info!("✅ [结果输出] 元数据已写入 {}", path.display());
    Ok(())
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        warn!("⚠️  [{}] 任务已取消", stage);
        return Err(PipelineError::Cancelled { stage });
    }
    Ok(())
}

fn log_stage_error(e: PipelineError) -> PipelineError {
    error!("❌ {}", e);
    e
}
