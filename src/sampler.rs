use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::DynamicImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::storage::frame_file_name;
use crate::types::{FrameRef, VideoInfo};

/// 采样间隔大于该值时才考虑一次性批量解码
pub const BATCH_MIN_INTERVAL: u64 = 25;
/// 批量解码时允许的最大帧数（控制内存占用）
pub const BATCH_MAX_FRAMES: usize = 1000;

/// 视频帧来源（解码能力由外部提供）
pub trait FrameSource: Send + Sync {
    /// 探测帧率、总帧数、时长
    fn probe(&self, video: &Path) -> PipelineResult<VideoInfo>;

    /// 在一次解码过程中取回指定帧号的图像，按帧号升序返回
    fn decode_batch(&self, video: &Path, indices: &[u64]) -> PipelineResult<Vec<(u64, DynamicImage)>>;

    /// 逐帧解码；只有 `wanted` 返回 true 的帧才会转换为图像交给 `sink`
    fn decode_stream(
        &self,
        video: &Path,
        wanted: &(dyn Fn(u64) -> bool + Sync),
        sink: &mut dyn FnMut(u64, DynamicImage) -> PipelineResult<()>,
    ) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// 一次解码取回全部目标帧（单帧开销低，内存有上限）
    Batch,
    /// 逐帧解码并按间隔筛选（内存最小，单帧开销高）
    Stream,
}

/// 抽帧计划：覆盖 [0, frame_count)，间隔为 interval
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub interval: u64,
    pub frame_count: u64,
    pub indices: Vec<u64>,
    pub strategy: SamplingStrategy,
}

impl SamplingPlan {
    pub fn new(frame_count: u64, interval: u64) -> PipelineResult<Self> {
        if interval == 0 {
            return Err(PipelineError::invalid_argument("采样间隔必须大于 0"));
        }
        let indices: Vec<u64> = (0..frame_count).step_by(interval as usize).collect();
        let strategy = if interval > BATCH_MIN_INTERVAL && indices.len() < BATCH_MAX_FRAMES {
            SamplingStrategy::Batch
        } else {
            SamplingStrategy::Stream
        };
        Ok(Self {
            interval,
            frame_count,
            indices,
            strategy,
        })
    }

    pub fn contains(&self, frame_index: u64) -> bool {
        frame_index < self.frame_count && frame_index % self.interval == 0
    }
}

/// 抽帧结果目录，文件名为 10 位补零帧号
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
    overwrite: bool,
}

impl FrameStore {
    pub fn new(dir: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            dir: dir.into(),
            overwrite,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, frame_index: u64) -> PathBuf {
        self.dir.join(frame_file_name(frame_index))
    }

    /// 该帧是否需要（重新）写入
    pub fn needs_write(&self, frame_index: u64) -> bool {
        self.overwrite || !self.path_for(frame_index).exists()
    }

    /// 写入一帧；已存在且未开启覆盖时跳过，返回是否实际写入
    pub fn write(&self, frame_index: u64, image: &DynamicImage) -> PipelineResult<bool> {
        if !self.needs_write(frame_index) {
            return Ok(false);
        }
        let path = self.path_for(frame_index);
        DynamicImage::ImageRgb8(image.to_rgb8())
            .save(&path)
            .map_err(|e| PipelineError::image(format!("保存视频帧 {}", path.display()), e))?;
        Ok(true)
    }
}

/// 抽帧统计
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub video_info: VideoInfo,
    pub plan: SamplingPlan,
    /// 实际写入的帧数
    pub written: usize,
    /// 已存在而跳过的帧数
    pub skipped: usize,
}

/// 帧采样器：按固定间隔从视频中抽帧并写入帧目录
pub struct FrameSampler<'a> {
    source: &'a dyn FrameSource,
    store: FrameStore,
    interval: u64,
    cancel: CancellationToken,
}

impl<'a> FrameSampler<'a> {
    pub fn new(source: &'a dyn FrameSource, store: FrameStore, interval: u64) -> Self {
        Self {
            source,
            store,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// 执行抽帧，返回统计信息
    pub fn sample(&self, video: &Path) -> PipelineResult<SampleReport> {
        if !video.exists() {
            return Err(PipelineError::precondition(
                Stage::Sample,
                format!("视频文件不存在: {}", video.display()),
            ));
        }
        if self.interval == 0 {
            return Err(PipelineError::invalid_argument("采样间隔必须大于 0"));
        }

        std::fs::create_dir_all(self.store.dir())
            .map_err(|e| PipelineError::io(format!("创建帧目录 {}", self.store.dir().display()), e))?;

        let start = Instant::now();
        let video_info = self.source.probe(video)?;
        let plan = SamplingPlan::new(video_info.frame_count, self.interval)?;
        info!(
            "⏳ [视频抽帧] 总帧数 {}，间隔 {}，目标 {} 帧，策略 {:?}",
            video_info.frame_count,
            plan.interval,
            plan.indices.len(),
            plan.strategy
        );

        let (written, skipped) = match plan.strategy {
            SamplingStrategy::Batch => self.sample_batch(video, &plan)?,
            SamplingStrategy::Stream => self.sample_stream(video, &plan)?,
        };

        info!(
            "✅ [视频抽帧] 完成，写入 {} 帧，跳过 {} 帧，耗时: {:.2}秒",
            written,
            skipped,
            start.elapsed().as_secs_f64()
        );

        Ok(SampleReport {
            video_info,
            plan,
            written,
            skipped,
        })
    }

    fn sample_batch(&self, video: &Path, plan: &SamplingPlan) -> PipelineResult<(usize, usize)> {
        let pending: Vec<u64> = plan
            .indices
            .iter()
            .copied()
            .filter(|&index| self.store.needs_write(index))
            .collect();
        let skipped = plan.indices.len() - pending.len();
        if pending.is_empty() {
            return Ok((0, skipped));
        }

        self.check_cancelled()?;
        let frames = self.source.decode_batch(video, &pending)?;

        let mut written = 0;
        let mut seen = HashSet::with_capacity(frames.len());
        for (index, image) in frames {
            self.check_cancelled()?;
            if !plan.contains(index) || !seen.insert(index) {
                warn!("⚠️  [视频抽帧] 解码器返回了计划外或重复的帧 {}，已忽略", index);
                continue;
            }
            if self.store.write(index, &image)? {
                debug!("💾 [视频抽帧] 已保存帧 {}", index);
                written += 1;
            }
        }
        Ok((written, skipped))
    }

    fn sample_stream(&self, video: &Path, plan: &SamplingPlan) -> PipelineResult<(usize, usize)> {
        let skipped = plan
            .indices
            .iter()
            .filter(|&&index| !self.store.needs_write(index))
            .count();

        let store = &self.store;
        let wanted = |index: u64| plan.contains(index) && store.needs_write(index);

        let mut written = 0;
        let mut seen = HashSet::new();
        let mut sink = |index: u64, image: DynamicImage| -> PipelineResult<()> {
            self.check_cancelled()?;
            if !plan.contains(index) || !seen.insert(index) {
                return Ok(());
            }
            if store.write(index, &image)? {
                debug!("💾 [视频抽帧] 已保存帧 {}", index);
                written += 1;
            }
            Ok(())
        };
        self.source.decode_stream(video, &wanted, &mut sink)?;
        Ok((written, skipped))
    }

    /// 按帧号升序惰性返回已落盘的采样帧
    pub fn frames<'r>(&'r self, report: &'r SampleReport) -> impl Iterator<Item = FrameRef> + 'r {
        report.plan.indices.iter().filter_map(move |&index| {
            let image_path = self.store.path_for(index);
            if !image_path.exists() {
                warn!("⚠️  [视频抽帧] 帧 {} 未能解码，已跳过", index);
                return None;
            }
            Some(FrameRef {
                frame_index: index,
                timestamp_seconds: report.video_info.timestamp_of(index),
                image_path,
            })
        })
    }

    fn check_cancelled(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Stage::Sample });
        }
        Ok(())
    }
}
