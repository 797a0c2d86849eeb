//! 根据对齐结果切分视频分段
//!
//! 第 i 张幻灯片占据 `[t_i, t_{i+1})`，最后一张占据 `[t_n, 视频时长)`，
//! 相邻分段首尾相接。后一张的匹配时间早于前一张时，前一张的分段长度为 0。
//! 字幕和音频由外部能力按区间提取，
//! 音频随后移动到 `audios/<slide_no>.mp3`。

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExtractionTarget, PipelineError, PipelineResult, Stage};
use crate::storage::{relocate_file, StorageLayout};
use crate::types::{AlignmentResult, SlideSegment, TimeRange};

/// 外部提供的字幕/音频提取结果
#[derive(Debug, Clone, PartialEq)]
pub struct ClipExtraction {
    pub subtitle_text: String,
    /// 提取器生成的临时音频文件
    pub clip_path: PathBuf,
}

/// 按时间区间提取字幕和音频的能力
pub trait SubtitleAudioExtractor: Send + Sync {
    fn extract(&self, video: &Path, slide_index: usize, range: TimeRange) -> PipelineResult<ClipExtraction>;
}

/// 由对齐结果计算每张幻灯片的时间区间
pub fn plan_ranges(results: &[AlignmentResult], duration_seconds: f64) -> PipelineResult<Vec<TimeRange>> {
    if results.is_empty() {
        return Err(PipelineError::precondition(Stage::Segment, "没有对齐结果"));
    }
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(PipelineError::precondition(
            Stage::Segment,
            format!("视频时长无效: {}", duration_seconds),
        ));
    }

    let mut ranges = Vec::with_capacity(results.len());
    for (position, current) in results.iter().enumerate() {
        let start = current.matched_timestamp_seconds;
        if start < 0.0 {
            return Err(segmentation(current.slide_index, format!("匹配时间为负: {:.3}s", start)));
        }

        let end = match results.get(position + 1) {
            Some(next) => {
                let next_start = next.matched_timestamp_seconds;
                if next_start < start {
                    // 讲者回翻到前面的幻灯片：前者分段收缩为 0，顺序问题记入 order_violations
                    warn!(
                        "⚠️  [分段切片] 幻灯片 {} 的匹配时间 {:.3}s 早于幻灯片 {} 的 {:.3}s，前者分段长度为 0",
                        next.slide_index, next_start, current.slide_index, start
                    );
                    start
                } else {
                    if next_start == start {
                        warn!(
                            "⚠️  [分段切片] 幻灯片 {} 与 {} 匹配到同一时刻 {:.3}s，前者分段长度为 0",
                            current.slide_index, next.slide_index, start
                        );
                    }
                    next_start
                }
            }
            None => {
                if start >= duration_seconds {
                    return Err(segmentation(
                        current.slide_index,
                        format!("匹配时间 {:.3}s 不在视频时长 {:.3}s 之内", start, duration_seconds),
                    ));
                }
                duration_seconds
            }
        };

        ranges.push(TimeRange {
            start_seconds: start,
            end_seconds: end,
        });
    }
    Ok(ranges)
}

fn segmentation(slide_index: usize, message: String) -> PipelineError {
    PipelineError::Segmentation {
        stage: Stage::Segment,
        slide_index,
        message,
    }
}

pub struct SegmentBuilder<'a> {
    extractor: &'a dyn SubtitleAudioExtractor,
    layout: &'a StorageLayout,
    cancel: CancellationToken,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(extractor: &'a dyn SubtitleAudioExtractor, layout: &'a StorageLayout) -> Self {
        Self {
            extractor,
            layout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(
        &self,
        video: &Path,
        results: &[AlignmentResult],
        duration_seconds: f64,
    ) -> PipelineResult<Vec<SlideSegment>> {
        let start = Instant::now();
        let ranges = plan_ranges(results, duration_seconds)?;

        let mut segments = Vec::with_capacity(ranges.len());
        for (result, range) in results.iter().zip(ranges) {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage: Stage::Segment });
            }
            segments.push(self.build_one(video, result.slide_index, range)?);
        }

        info!(
            "✅ [分段切片] {} 个分段完成，耗时: {:.2}秒",
            segments.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(segments)
    }

    fn build_one(&self, video: &Path, slide_index: usize, range: TimeRange) -> PipelineResult<SlideSegment> {
        // 长度为 0 的分段没有可提取的内容
        if range.duration() <= 0.0 {
            return Ok(SlideSegment {
                slide_index,
                start_seconds: range.start_seconds,
                end_seconds: range.end_seconds,
                subtitle_text: String::new(),
                audio_clip_path: PathBuf::new(),
            });
        }

        let extraction = self
            .extractor
            .extract(video, slide_index, range)
            .map_err(|e| match e {
                PipelineError::Extraction { message, .. } => PipelineError::Extraction {
                    stage: Stage::Segment,
                    target: ExtractionTarget::Segment(slide_index),
                    message,
                },
                other => other,
            })?;

        let audio_path = self.layout.audio_path(slide_index);
        if extraction.clip_path != audio_path {
            relocate_file(&extraction.clip_path, &audio_path)?;
        }
        debug!(
            "[分段切片] 幻灯片 {}: {:.2}s - {:.2}s -> {}",
            slide_index,
            range.start_seconds,
            range.end_seconds,
            audio_path.display()
        );

        Ok(SlideSegment {
            slide_index,
            start_seconds: range.start_seconds,
            end_seconds: range.end_seconds,
            subtitle_text: extraction.subtitle_text,
            audio_clip_path: audio_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn result(slide_index: usize, timestamp: f64) -> AlignmentResult {
        AlignmentResult {
            slide_index,
            matched_frame_index: (timestamp * 30.0) as u64,
            matched_timestamp_seconds: timestamp,
            score: 1.0,
        }
    }

    /// 在临时目录写一个假的音频文件
    struct FakeExtractor {
        scratch: PathBuf,
        calls: Mutex<Vec<(usize, TimeRange)>>,
    }

    impl SubtitleAudioExtractor for FakeExtractor {
        fn extract(&self, _video: &Path, slide_index: usize, range: TimeRange) -> PipelineResult<ClipExtraction> {
            self.calls.lock().unwrap().push((slide_index, range));
            let clip_path = self.scratch.join(format!("clip-{}.mp3", slide_index));
            std::fs::write(&clip_path, b"mp3").unwrap();
            Ok(ClipExtraction {
                subtitle_text: format!("said during slide {}", slide_index),
                clip_path,
            })
        }
    }

    struct FailingExtractor;

    impl SubtitleAudioExtractor for FailingExtractor {
        fn extract(&self, _video: &Path, _slide_index: usize, _range: TimeRange) -> PipelineResult<ClipExtraction> {
            Err(PipelineError::extraction(
                Stage::Segment,
                ExtractionTarget::Path(PathBuf::from("lecture.mp4")),
                "ffmpeg exited",
            ))
        }
    }

    #[test]
    fn test_ranges_are_contiguous_and_end_at_duration() {
        let ranges = plan_ranges(&[result(1, 0.0), result(2, 10.0), result(3, 15.0)], 20.0).unwrap();
        assert_eq!(ranges.len(), 3);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_seconds, pair[1].start_seconds);
        }
        assert_eq!(ranges[0].start_seconds, 0.0);
        assert_eq!(ranges[2].end_seconds, 20.0);
    }

    #[test]
    fn test_equal_timestamps_give_empty_segment() {
        let ranges = plan_ranges(&[result(1, 5.0), result(2, 5.0)], 9.0).unwrap();
        assert_eq!(ranges[0].duration(), 0.0);
        assert_eq!(ranges[1].end_seconds, 9.0);
    }

    #[test]
    fn test_decreasing_timestamp_collapses_earlier_segment() {
        let ranges = plan_ranges(&[result(1, 8.0), result(2, 3.0), result(3, 12.0)], 20.0).unwrap();
        assert_eq!(ranges[0].start_seconds, 8.0);
        assert_eq!(ranges[0].duration(), 0.0);
        assert_eq!(ranges[1].start_seconds, 3.0);
        assert_eq!(ranges[1].end_seconds, 12.0);
        assert_eq!(ranges[2].end_seconds, 20.0);
    }

    #[test]
    fn test_terminal_timestamp_past_duration() {
        let err = plan_ranges(&[result(1, 0.0), result(2, 20.0)], 20.0).unwrap_err();
        assert!(matches!(err, PipelineError::Segmentation { slide_index: 2, .. }));
    }

    #[test]
    fn test_empty_results_precondition() {
        let err = plan_ranges(&[], 20.0).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition { stage: Stage::Segment, .. }));
    }

    #[test]
    fn test_build_relocates_clips() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let layout = StorageLayout::new(dir.path(), "u1", "p1").unwrap();
        layout.ensure_dirs().unwrap();

        let extractor = FakeExtractor {
            scratch,
            calls: Mutex::new(Vec::new()),
        };
        let builder = SegmentBuilder::new(&extractor, &layout);
        let segments = builder
            .build(Path::new("lecture.mp4"), &[result(1, 0.0), result(2, 10.0), result(3, 15.0)], 20.0)
            .unwrap();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].start_seconds, 10.0);
        assert_eq!(segments[1].end_seconds, 15.0);
        assert_eq!(segments[2].end_seconds, 20.0);
        assert_eq!(segments[0].subtitle_text, "said during slide 1");
        for segment in &segments {
            assert_eq!(segment.audio_clip_path, layout.audio_path(segment.slide_index));
            assert!(segment.audio_clip_path.exists());
        }
        assert_eq!(extractor.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_zero_length_segment_skips_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "u1", "p1").unwrap();
        let extractor = FakeExtractor {
            scratch: dir.path().to_path_buf(),
            calls: Mutex::new(Vec::new()),
        };

        let segments = SegmentBuilder::new(&extractor, &layout)
            .build(Path::new("lecture.mp4"), &[result(1, 4.0), result(2, 4.0)], 10.0)
            .unwrap();

        assert_eq!(segments[0].subtitle_text, "");
        assert_eq!(extractor.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_extraction_failure_names_segment() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "u1", "p1").unwrap();

        let err = SegmentBuilder::new(&FailingExtractor, &layout)
            .build(Path::new("lecture.mp4"), &[result(1, 0.0)], 10.0)
            .unwrap_err();
        match err {
            PipelineError::Extraction { stage, target, .. } => {
                assert_eq!(stage, Stage::Segment);
                assert_eq!(target, ExtractionTarget::Segment(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_build() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "u1", "p1").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = SegmentBuilder::new(&FailingExtractor, &layout)
            .with_cancellation(cancel)
            .build(Path::new("lecture.mp4"), &[result(1, 0.0)], 10.0)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Segment }));
    }
}
