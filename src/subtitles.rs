//! SRT 字幕解析
//!
//! 视频旁边若有同名 `.srt` 文件，分段时按时间区间取出对应的字幕文字。

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::types::TimeRange;

static TIMING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->\s*(\d+):(\d{2}):(\d{2})[,.](\d{1,3})")
        .expect("static timing pattern")
});

#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

impl Cue {
    fn midpoint(&self) -> f64 {
        (self.start_seconds + self.end_seconds) / 2.0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtitleTrack {
    cues: Vec<Cue>,
}

impl SubtitleTrack {
    pub fn parse(content: &str) -> PipelineResult<Self> {
        let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
        let mut cues = Vec::new();

        for block in cue_blocks(&content) {
            let mut lines = block.into_iter().peekable();
            // 序号行可省略
            if let Some(first) = lines.peek() {
                if first.trim().chars().all(|c| c.is_ascii_digit()) {
                    lines.next();
                }
            }
            let Some(timing) = lines.next() else {
                continue;
            };
            let Some(caps) = TIMING_LINE.captures(timing) else {
                return Err(PipelineError::invalid_argument(format!("无法解析字幕时间行: {:?}", timing.trim())));
            };
            let field = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
            let millis = |i: usize| {
                let raw = &caps[i];
                raw.parse::<f64>().unwrap_or(0.0) / 10f64.powi(raw.len() as i32)
            };
            let start_seconds = field(1) * 3600.0 + field(2) * 60.0 + field(3) + millis(4);
            let end_seconds = field(5) * 3600.0 + field(6) * 60.0 + field(7) + millis(8);

            let text = lines.map(str::trim).collect::<Vec<_>>().join(" ");
            cues.push(Cue {
                start_seconds,
                end_seconds,
                text,
            });
        }

        cues.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
        Ok(Self { cues })
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("读取字幕 {}", path.display()), e))?;
        Self::parse(&content)
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    /// 中点落在区间内的字幕，以空格连接
    ///
    /// 按中点归属保证相邻分段之间不会重复同一句字幕。
    pub fn text_in(&self, range: TimeRange) -> String {
        self.cues
            .iter()
            .filter(|cue| {
                let mid = cue.midpoint();
                mid >= range.start_seconds && mid < range.end_seconds
            })
            .map(|cue| cue.text.as_str())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 视频旁边的同名字幕文件（`lecture.mp4` -> `lecture.srt`）
pub fn sidecar_path(video: &Path) -> PathBuf {
    video.with_extension("srt")
}

/// 按空白行（只含空格的行也算）切分字幕块
fn cue_blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}
