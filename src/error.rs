use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// 流水线阶段，用于在错误中标明失败位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rasterize,
    Sample,
    Extract,
    Align,
    Segment,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Rasterize => "文档光栅化",
            Stage::Sample => "视频抽帧",
            Stage::Extract => "文字识别",
            Stage::Align => "幻灯片对齐",
            Stage::Segment => "分段切片",
            Stage::Report => "结果输出",
        };
        f.write_str(name)
    }
}

/// 提取失败的对象：某张幻灯片、某个视频帧或某个分段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionTarget {
    Slide(usize),
    Frame(u64),
    Segment(usize),
    Path(PathBuf),
}

impl fmt::Display for ExtractionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionTarget::Slide(index) => write!(f, "幻灯片 {}", index),
            ExtractionTarget::Frame(index) => write!(f, "视频帧 {}", index),
            ExtractionTarget::Segment(index) => write!(f, "分段 {}", index),
            ExtractionTarget::Path(path) => write!(f, "文件 {}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{stage}] 前置条件不满足: {message}")]
    Precondition { stage: Stage, message: String },

    #[error("[幻灯片对齐] 幻灯片 {slide_index} 没有满足阈值的候选帧（候选数 {candidates}，最高分 {max_score:.4}）")]
    Alignment {
        slide_index: usize,
        candidates: usize,
        max_score: f64,
    },

    #[error("[{stage}] 分段失败（幻灯片 {slide_index}）: {message}")]
    Segmentation {
        stage: Stage,
        slide_index: usize,
        message: String,
    },

    #[error("[{stage}] 提取失败（{target}）: {message}")]
    Extraction {
        stage: Stage,
        target: ExtractionTarget,
        message: String,
    },

    #[error("外部能力不可用: {capability}: {source}")]
    CapabilityUnavailable {
        capability: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("参数无效: {message}")]
    InvalidArgument { message: String },

    #[error("I/O 错误（{context}）: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("图像处理失败（{context}）: {source}")]
    Image {
        context: String,
        #[source]
        source: image::ImageError,
    },

    #[error("JSON 序列化失败（{context}）: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("[视频抽帧] 视频解码失败: {message}")]
    Decode { message: String },

    #[error("[{stage}] 任务已取消")]
    Cancelled { stage: Stage },

    #[error("处理超时（{seconds} 秒）")]
    Timeout { seconds: u64 },

    #[error("后台任务异常退出: {message}")]
    TaskFailed { message: String },
}

impl PipelineError {
    pub fn precondition(stage: Stage, message: impl Into<String>) -> Self {
        Self::Precondition {
            stage,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn extraction(stage: Stage, target: ExtractionTarget, err: impl fmt::Display) -> Self {
        Self::Extraction {
            stage,
            target,
            message: err.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn image(context: impl Into<String>, source: image::ImageError) -> Self {
        Self::Image {
            context: context.into(),
            source,
        }
    }

    pub fn decode(err: impl fmt::Display) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }

    /// 失败发生的阶段（无法归属到具体阶段时返回 None）
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Precondition { stage, .. }
            | Self::Segmentation { stage, .. }
            | Self::Extraction { stage, .. }
            | Self::Cancelled { stage } => Some(*stage),
            Self::Alignment { .. } => Some(Stage::Align),
            Self::Decode { .. } => Some(Stage::Sample),
            Self::CapabilityUnavailable { .. }
            | Self::InvalidArgument { .. }
            | Self::Io { .. }
            | Self::Image { .. }
            | Self::Json { .. }
            | Self::Timeout { .. }
            | Self::TaskFailed { .. } => None,
        }
    }

    /// 是否值得调整采样参数后重试
    pub fn is_retryable_with_resampling(&self) -> bool {
        matches!(
            self,
            Self::Alignment { .. } | Self::Segmentation { .. } | Self::Timeout { .. }
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_error_names_slide() {
        let err = PipelineError::Alignment {
            slide_index: 7,
            candidates: 12,
            max_score: 0.5,
        };
        assert!(err.to_string().contains("幻灯片 7"));
        assert_eq!(err.stage(), Some(Stage::Align));
        assert!(err.is_retryable_with_resampling());
    }

    #[test]
    fn test_extraction_error_keeps_target() {
        let err = PipelineError::extraction(Stage::Extract, ExtractionTarget::Frame(120), "tesseract exited");
        match &err {
            PipelineError::Extraction { target, .. } => assert_eq!(*target, ExtractionTarget::Frame(120)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retryable_with_resampling());
    }
}
