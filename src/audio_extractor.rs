use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ExtractionTarget, PipelineError, PipelineResult, Stage};
use crate::segments::{ClipExtraction, SubtitleAudioExtractor};
use crate::subtitles::{sidecar_path, SubtitleTrack};
use crate::types::TimeRange;

/// 调用 ffmpeg 命令行按区间截取音频，字幕取自视频旁的 `.srt` 文件
pub struct FfmpegClipExtractor {
    binary: PathBuf,
    work_dir: PathBuf,
    /// 按视频路径缓存解析过的字幕；没有字幕文件时缓存空轨道
    subtitles: Mutex<HashMap<PathBuf, Arc<SubtitleTrack>>>,
}

impl FfmpegClipExtractor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            work_dir: work_dir.into(),
            subtitles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// 区间内的字幕文字；视频没有字幕文件时为空字符串
    pub fn subtitle_text(&self, video: &Path, range: TimeRange) -> PipelineResult<String> {
        Ok(self.track_for(video)?.text_in(range))
    }

    fn track_for(&self, video: &Path) -> PipelineResult<Arc<SubtitleTrack>> {
        let mut cache = self.subtitles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(track) = cache.get(video) {
            return Ok(Arc::clone(track));
        }

        let sidecar = sidecar_path(video);
        let track = if sidecar.exists() {
            let track = SubtitleTrack::load(&sidecar)?;
            debug!("[字幕] 读取 {}: {} 条", sidecar.display(), track.cues().len());
            track
        } else {
            warn!("⚠️  [字幕] 未找到字幕文件 {}，字幕留空", sidecar.display());
            SubtitleTrack::default()
        };
        let track = Arc::new(track);
        cache.insert(video.to_path_buf(), Arc::clone(&track));
        Ok(track)
    }

    /// 截取 `[start, end)` 的音频并编码为 mp3
    fn cut_audio(&self, video: &Path, range: TimeRange, output: &Path) -> PipelineResult<()> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| PipelineError::io(format!("创建目录 {}", self.work_dir.display()), e))?;

        let output_status = Command::new(&self.binary)
            .arg("-loglevel")
            .arg("error") // 只显示错误信息
            .arg("-ss")
            .arg(format!("{:.3}", range.start_seconds))
            .arg("-t")
            .arg(format!("{:.3}", range.duration()))
            .arg("-i")
            .arg(video)
            .arg("-vn") // 不包含视频
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("-q:a")
            .arg("2")
            .arg("-y") // 覆盖输出文件
            .arg(output)
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => PipelineError::CapabilityUnavailable {
                    capability: "ffmpeg",
                    source: e,
                },
                _ => PipelineError::extraction(Stage::Segment, ExtractionTarget::Path(video.to_path_buf()), e),
            })?;

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(PipelineError::extraction(
                Stage::Segment,
                ExtractionTarget::Path(video.to_path_buf()),
                format!("音频截取失败: {}", stderr.trim()),
            ));
        }
        Ok(())
    }
}

impl SubtitleAudioExtractor for FfmpegClipExtractor {
    fn extract(&self, video: &Path, slide_index: usize, range: TimeRange) -> PipelineResult<ClipExtraction> {
        if !video.exists() {
            return Err(PipelineError::precondition(
                Stage::Segment,
                format!("视频文件不存在: {}", video.display()),
            ));
        }

        let clip_path = self
            .work_dir
            .join(format!("{}-{}.mp3", Uuid::new_v4(), slide_index));
        self.cut_audio(video, range, &clip_path)?;

        Ok(ClipExtraction {
            subtitle_text: self.subtitle_text(video, range)?,
            clip_path,
        })
    }
}
