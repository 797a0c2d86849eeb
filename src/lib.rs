pub mod alignment;
pub mod audio_extractor;
pub mod config;
pub mod error;
pub mod ocr;
pub mod processor;
pub mod rasterizer;
pub mod sampler;
pub mod segments;
pub mod similarity;
pub mod storage;
pub mod subtitles;
pub mod types;
#[cfg(feature = "ffmpeg")]
pub mod video_processor;
pub mod webhook;

pub use alignment::{order_violations, AlignmentEngine};
pub use audio_extractor::FfmpegClipExtractor;
pub use config::{ConfigLoader, PartialConfig};
pub use error::{ExtractionTarget, PipelineError, PipelineResult, Stage};
pub use ocr::{ContentExtractor, TesseractRecognizer, TextRecognizer};
pub use processor::{
    align_slides_to_video, build_scorer, run_pipeline, AlignConfig, AlignmentOutput, AlignmentRequest, Capabilities,
};
pub use rasterizer::{ExistingPagesRasterizer, PdftoppmRasterizer, Rasterizer};
pub use sampler::{FrameSampler, FrameSource, FrameStore, SampleReport, SamplingPlan, SamplingStrategy};
pub use segments::{ClipExtraction, SegmentBuilder, SubtitleAudioExtractor};
pub use similarity::{score_text, MatchMode, Scorer};
pub use storage::StorageLayout;
pub use types::{
    AlignmentMetadata, AlignmentResult, FrameRef, MatchCandidate, SampledFrame, SlideImage, SlideRecord, SlideSegment,
    TimeRange, VideoInfo,
};
#[cfg(feature = "ffmpeg")]
pub use video_processor::FfmpegFrameSource;
