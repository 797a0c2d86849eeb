use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, Rgb};
use tokio_util::sync::CancellationToken;

use slide_align::storage::{page_file_name, parse_frame_file_name};
use slide_align::{
    align_slides_to_video, AlignConfig, AlignmentMetadata, AlignmentRequest, Capabilities, ClipExtraction,
    ExistingPagesRasterizer, FrameSource, MatchMode, PipelineError, PipelineResult, Rasterizer, Stage,
    SubtitleAudioExtractor, TextRecognizer, TimeRange, VideoInfo,
};

/// 每张幻灯片画面各不相同的测试图案
fn pattern(kind: usize) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 64, |x, y| {
        let on = match kind % 3 {
            0 => (y / 8) % 2 == 0,
            1 => (x / 8) % 2 == 0,
            _ => ((x / 16) + (y / 16)) % 2 == 0,
        };
        if on {
            Rgb([240, 240, 240])
        } else {
            Rgb([20, 20, 20])
        }
    }))
}

/// 把幻灯片写成 `<n>.jpg`
struct FakeRasterizer {
    slide_count: usize,
}

impl Rasterizer for FakeRasterizer {
    fn rasterize(&self, document: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        if !document.exists() {
            return Err(PipelineError::precondition(Stage::Rasterize, "document missing"));
        }
        std::fs::create_dir_all(pages_dir).unwrap();
        Ok((1..=self.slide_count)
            .map(|n| {
                let path = pages_dir.join(page_file_name(n));
                pattern(n - 1).save(&path).unwrap();
                path
            })
            .collect())
    }
}

/// 按时间线播放幻灯片的假视频：`timeline[i]` 是从第 i 个 `seconds_per_slot` 开始显示的幻灯片（0 起）
struct ScriptedVideo {
    info: VideoInfo,
    seconds_per_slot: f64,
    timeline: Vec<usize>,
}

impl ScriptedVideo {
    fn new(fps: f64, frame_count: u64, seconds_per_slot: f64, timeline: Vec<usize>) -> Self {
        Self {
            info: VideoInfo {
                fps,
                frame_count,
                duration_seconds: frame_count as f64 / fps,
                width: 64,
                height: 64,
            },
            seconds_per_slot,
            timeline,
        }
    }

    fn slide_at(&self, frame_index: u64) -> usize {
        let slot = (self.info.timestamp_of(frame_index) / self.seconds_per_slot) as usize;
        self.timeline[slot.min(self.timeline.len() - 1)]
    }
}

impl FrameSource for ScriptedVideo {
    fn probe(&self, _video: &Path) -> PipelineResult<VideoInfo> {
        Ok(self.info)
    }

    fn decode_batch(&self, _video: &Path, indices: &[u64]) -> PipelineResult<Vec<(u64, DynamicImage)>> {
        Ok(indices.iter().map(|&i| (i, pattern(self.slide_at(i)))).collect())
    }

    fn decode_stream(
        &self,
        _video: &Path,
        wanted: &(dyn Fn(u64) -> bool + Sync),
        sink: &mut dyn FnMut(u64, DynamicImage) -> PipelineResult<()>,
    ) -> PipelineResult<()> {
        for index in 0..self.info.frame_count {
            if wanted(index) {
                sink(index, pattern(self.slide_at(index)))?;
            }
        }
        Ok(())
    }
}

/// 幻灯片页面按页码取文字，视频帧按帧号取文字
struct ScriptedRecognizer {
    slide_texts: Vec<String>,
    frame_texts: Vec<String>,
    interval: u64,
    delay: Option<Duration>,
}

impl TextRecognizer for ScriptedRecognizer {
    fn recognize(&self, image: &Path) -> PipelineResult<String> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let in_frames_dir = image.parent().and_then(|p| p.file_name()).is_some_and(|n| n == "video_frames");
        if in_frames_dir {
            let frame_index = parse_frame_file_name(image).expect("frame file name");
            let slot = (frame_index / self.interval) as usize;
            return Ok(self.frame_texts.get(slot).cloned().unwrap_or_default());
        }
        let page: usize = image
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .expect("page file name");
        Ok(self.slide_texts[page - 1].clone())
    }
}

struct FakeClips {
    scratch: PathBuf,
}

impl SubtitleAudioExtractor for FakeClips {
    fn extract(&self, _video: &Path, slide_index: usize, range: TimeRange) -> PipelineResult<ClipExtraction> {
        std::fs::create_dir_all(&self.scratch).unwrap();
        let clip_path = self.scratch.join(format!("clip-{}.mp3", slide_index));
        std::fs::write(&clip_path, b"ID3").unwrap();
        Ok(ClipExtraction {
            subtitle_text: format!("{:.1}-{:.1}", range.start_seconds, range.end_seconds),
            clip_path,
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    request: AlignmentRequest,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let document = root.join("deck.pdf");
        let video = root.join("lecture.mp4");
        std::fs::write(&document, b"%PDF-1.4").unwrap();
        std::fs::write(&video, b"not really a video").unwrap();
        Self {
            request: AlignmentRequest {
                document,
                video,
                user_id: "7".to_string(),
                project_id: "rust-101".to_string(),
            },
            root,
            _dir: dir,
        }
    }

    fn config(&self) -> AlignConfig {
        AlignConfig {
            storage_root: self.root.join("data"),
            ..AlignConfig::default()
        }
    }

    fn capabilities(&self, slide_texts: &[&str], frame_texts: &[&str], timeline: Vec<usize>) -> Capabilities {
        // 12 fps，每 60 帧采样一次 -> 采样点间隔 5 秒
        let frame_count = 60 * (timeline.len() as u64 - 1) + 10;
        Capabilities {
            rasterizer: Arc::new(FakeRasterizer {
                slide_count: slide_texts.len(),
            }),
            frame_source: Arc::new(ScriptedVideo::new(12.0, frame_count, 5.0, timeline)),
            recognizer: Arc::new(ScriptedRecognizer {
                slide_texts: slide_texts.iter().map(|s| s.to_string()).collect(),
                frame_texts: frame_texts.iter().map(|s| s.to_string()).collect(),
                interval: 60,
                delay: None,
            }),
            clips: Arc::new(FakeClips {
                scratch: self.root.join("scratch"),
            }),
        }
    }
}

fn timestamps(records: &[slide_align::SlideRecord]) -> Vec<f64> {
    records.iter().map(|r| r.matched_timestamp_seconds).collect()
}

#[tokio::test]
async fn earliest_tie_wins_for_each_slide() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(
        &["hello world", "foo bar", "baz qux"],
        &["hello world", "hello world", "foo bar baz", "baz qux", "baz qux"],
        vec![0, 0, 1, 2, 2],
    );

    let output = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(timestamps(&output.records), vec![0.0, 10.0, 15.0]);
    let slide_numbers: Vec<usize> = output.records.iter().map(|r| r.slide_no).collect();
    assert_eq!(slide_numbers, vec![1, 2, 3]);
    assert_eq!(output.records[0].slide_text, "hello world");
}

#[tokio::test]
async fn segments_are_contiguous_and_end_at_duration() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(
        &["hello world", "foo bar", "baz qux"],
        &["hello world", "hello world", "foo bar baz", "baz qux", "baz qux"],
        vec![0, 0, 1, 2, 2],
    );
    let config = fixture.config();

    let output = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap();

    let records = &output.records;
    for pair in records.windows(2) {
        assert_eq!(pair[0].end_seconds, pair[1].start_seconds);
    }
    assert_eq!(records[0].start_seconds, 0.0);
    assert_eq!(records[2].end_seconds, output.metadata.video_info.duration_seconds);
    assert_eq!(records[1].subtitles, "10.0-15.0");

    let audios = config.storage_root.join("7").join("rust-101").join("audios");
    for record in records {
        assert_eq!(record.audio_path, audios.join(format!("{}.mp3", record.slide_no)));
        assert!(record.audio_path.exists());
    }
}

#[tokio::test]
async fn metadata_written_to_slides_json() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(
        &["hello world", "foo bar"],
        &["hello world", "foo bar", "foo bar"],
        vec![0, 1, 1],
    );

    let output = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap();

    let json = std::fs::read_to_string(&output.metadata_path).unwrap();
    let stored: AlignmentMetadata = serde_json::from_str(&json).unwrap();
    assert_eq!(stored.slide_count, 2);
    assert_eq!(stored.sampled_frame_count, 3);
    assert_eq!(stored.match_mode, "text");
    assert_eq!(stored.slides, output.records);
    assert!(stored.order_violations.is_empty());
}

#[tokio::test]
async fn returning_to_earlier_slide_is_recorded_not_fatal() {
    let fixture = Fixture::new();
    // 讲者先讲第 2 张，再回到第 1 张，然后回到第 2 张
    let capabilities = fixture.capabilities(
        &["intro ownership", "borrowing rules", "lifetimes"],
        &["borrowing rules", "intro ownership", "borrowing rules", "lifetimes"],
        vec![1, 0, 1, 2],
    );

    let output = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(timestamps(&output.records), vec![5.0, 0.0, 15.0]);
    let first = &output.records[0];
    assert_eq!(first.start_seconds, 5.0);
    assert_eq!(first.end_seconds, 5.0);
    assert_eq!(first.subtitles, "");
    assert_eq!(output.records[1].end_seconds, 15.0);
    assert_eq!(output.records[1].subtitles, "0.0-15.0");

    let json = std::fs::read_to_string(&output.metadata_path).unwrap();
    let stored: AlignmentMetadata = serde_json::from_str(&json).unwrap();
    assert_eq!(stored.order_violations, vec![2]);
    assert_eq!(output.metadata.order_violations, vec![2]);
}

#[tokio::test]
async fn disjoint_vocabulary_still_gets_a_match() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(
        &["hello world", "quantum chromodynamics"],
        &["hello world", "hello world", "closing remarks"],
        vec![0, 0, 1],
    );

    let output = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.records.len(), 2);
    assert!(output.records[1].match_score > 0.0);
}

#[tokio::test]
async fn zero_sampled_frames_is_precondition_failure() {
    let fixture = Fixture::new();
    let mut capabilities = fixture.capabilities(&["hello world"], &[], vec![0]);
    capabilities.frame_source = Arc::new(ScriptedVideo::new(12.0, 0, 5.0, vec![0]));

    let err = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Precondition { stage: Stage::Align, .. }), "{err}");
}

#[tokio::test]
async fn missing_video_fails_before_decoding() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(&["hello world"], &["hello world"], vec![0]);
    let mut request = fixture.request.clone();
    request.video = fixture.root.join("missing.mp4");

    let err = align_slides_to_video(request, &fixture.config(), &capabilities, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Precondition { stage: Stage::Sample, .. }), "{err}");
}

#[tokio::test]
async fn missing_document_fails_even_with_prerendered_pages() {
    let fixture = Fixture::new();
    let config = fixture.config();
    let pages_dir = config.storage_root.join("7").join("rust-101").join("pdf_pages");
    std::fs::create_dir_all(&pages_dir).unwrap();
    pattern(0).save(pages_dir.join(page_file_name(1))).unwrap();

    let mut capabilities = fixture.capabilities(&["hello world"], &["hello world"], vec![0]);
    capabilities.rasterizer = Arc::new(ExistingPagesRasterizer);
    let mut request = fixture.request.clone();
    request.document = fixture.root.join("missing.pdf");

    let err = align_slides_to_video(request, &config, &capabilities, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Precondition { stage: Stage::Rasterize, .. }), "{err}");
}

#[tokio::test]
async fn image_mode_matches_by_picture() {
    let fixture = Fixture::new();
    // 文字全部为空，只能靠画面匹配
    let capabilities = fixture.capabilities(&["", "", ""], &[], vec![0, 0, 1, 2, 2]);
    let config = AlignConfig {
        match_mode: MatchMode::Ssim,
        ..fixture.config()
    };

    let output = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(timestamps(&output.records), vec![0.0, 10.0, 15.0]);
    assert_eq!(output.metadata.match_mode, "ssim");
}

#[tokio::test]
async fn rerun_reuses_sampled_frames() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(
        &["hello world", "foo bar"],
        &["hello world", "foo bar", "foo bar"],
        vec![0, 1, 1],
    );
    let config = fixture.config();

    let first = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap();
    let second = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.records, second.records);
    assert_ne!(first.metadata.run_id, second.metadata.run_id);
}

#[tokio::test]
async fn cancelled_before_start() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(&["hello world"], &["hello world"], vec![0]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = align_slides_to_video(fixture.request.clone(), &fixture.config(), &capabilities, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Rasterize }), "{err}");
}

#[tokio::test]
async fn slow_run_times_out() {
    let fixture = Fixture::new();
    let mut capabilities = fixture.capabilities(&["a1", "b2", "c3"], &["a1", "b2", "c3"], vec![0, 1, 2]);
    capabilities.recognizer = Arc::new(ScriptedRecognizer {
        slide_texts: vec!["a1".into(), "b2".into(), "c3".into()],
        frame_texts: vec!["a1".into(), "b2".into(), "c3".into()],
        interval: 60,
        delay: Some(Duration::from_millis(400)),
    });
    let config = AlignConfig {
        timeout_secs: Some(1),
        parallel: false,
        ..fixture.config()
    };

    let err = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout { seconds: 1 }), "{err}");
}

#[tokio::test]
async fn invalid_config_rejected_up_front() {
    let fixture = Fixture::new();
    let capabilities = fixture.capabilities(&["hello world"], &["hello world"], vec![0]);
    let config = AlignConfig {
        sampling_interval: 0,
        ..fixture.config()
    };

    let err = align_slides_to_video(fixture.request.clone(), &config, &capabilities, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidArgument { .. }));
}
