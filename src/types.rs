use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 视频基础信息（由帧源探测得到）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// 视频帧率
    pub fps: f64,
    /// 总帧数
    pub frame_count: u64,
    /// 视频总时长（秒）
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// 帧号对应的时间戳（秒）
    pub fn timestamp_of(&self, frame_index: u64) -> f64 {
        if self.fps > 0.0 {
            frame_index as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// 一页幻灯片（光栅化后的图片 + 识别出的文字）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideImage {
    /// 幻灯片编号（从 1 开始，连续）
    pub slide_index: usize,
    pub source_path: PathBuf,
    pub extracted_text: String,
}

/// 抽帧得到、尚未识别文字的视频帧
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub frame_index: u64,
    pub timestamp_seconds: f64,
    pub image_path: PathBuf,
}

/// 已识别文字的采样帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledFrame {
    /// 帧号（单调递增，间隔等于采样间隔）
    pub frame_index: u64,
    pub timestamp_seconds: f64,
    pub image_path: PathBuf,
    pub extracted_text: String,
}

impl SampledFrame {
    pub fn from_ref(frame: FrameRef, extracted_text: String) -> Self {
        Self {
            frame_index: frame.frame_index,
            timestamp_seconds: frame.timestamp_seconds,
            image_path: frame.image_path,
            extracted_text,
        }
    }
}

/// 单张幻灯片对单个候选帧的打分结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    pub frame_index: u64,
    pub timestamp_seconds: f64,
    pub score: f64,
}

/// 单张幻灯片的对齐结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub slide_index: usize,
    pub matched_frame_index: u64,
    pub matched_timestamp_seconds: f64,
    pub score: f64,
}

/// 时间区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// 单张幻灯片对应的视频分段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideSegment {
    pub slide_index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub subtitle_text: String,
    pub audio_clip_path: PathBuf,
}

/// 对外输出的幻灯片记录，交给调用方持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideRecord {
    /// 幻灯片编号（从 1 开始）
    pub slide_no: usize,
    pub slide_text: String,
    pub image_path: PathBuf,
    pub matched_frame_index: u64,
    pub matched_timestamp_seconds: f64,
    pub match_score: f64,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub subtitles: String,
    pub audio_path: PathBuf,
}

impl SlideRecord {
    pub fn assemble(slide: &SlideImage, result: &AlignmentResult, segment: &SlideSegment) -> Self {
        Self {
            slide_no: slide.slide_index,
            slide_text: slide.extracted_text.clone(),
            image_path: slide.source_path.clone(),
            matched_frame_index: result.matched_frame_index,
            matched_timestamp_seconds: result.matched_timestamp_seconds,
            match_score: result.score,
            start_seconds: segment.start_seconds,
            end_seconds: segment.end_seconds,
            subtitles: segment.subtitle_text.clone(),
            audio_path: segment.audio_clip_path.clone(),
        }
    }
}

/// 一次对齐运行的元数据（写入 slides.json）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentMetadata {
    pub run_id: String,
    pub document: String,
    pub video: String,
    pub video_info: VideoInfo,
    pub sampling_interval: u64,
    pub sampled_frame_count: usize,
    pub match_mode: String,
    pub slide_count: usize,
    /// 匹配帧号非单调的幻灯片编号
    pub order_violations: Vec<usize>,
    pub elapsed_seconds: f64,
    pub slides: Vec<SlideRecord>,
}
