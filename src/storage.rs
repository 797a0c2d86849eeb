use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

const PDF_PAGES_DIR: &str = "pdf_pages";
const VIDEO_FRAMES_DIR: &str = "video_frames";
const AUDIOS_DIR: &str = "audios";
const METADATA_FILE: &str = "slides.json";

/// 按用户/项目划分的存储目录
///
/// ```text
/// <root>/<user>/<project>/pdf_pages/<index>.jpg
/// <root>/<user>/<project>/video_frames/<index:010>.jpg
/// <root>/<user>/<project>/audios/<slide_no>.mp3
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    project_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>, user_id: &str, project_id: &str) -> PipelineResult<Self> {
        validate_segment("user_id", user_id)?;
        validate_segment("project_id", project_id)?;
        Ok(Self {
            project_dir: root.as_ref().join(user_id).join(project_id),
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.project_dir.join(PDF_PAGES_DIR)
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.project_dir.join(VIDEO_FRAMES_DIR)
    }

    pub fn audios_dir(&self) -> PathBuf {
        self.project_dir.join(AUDIOS_DIR)
    }

    pub fn audio_path(&self, slide_no: usize) -> PathBuf {
        self.audios_dir().join(format!("{}.mp3", slide_no))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.project_dir.join(METADATA_FILE)
    }

    /// 创建全部子目录
    pub fn ensure_dirs(&self) -> PipelineResult<()> {
        for dir in [self.pages_dir(), self.frames_dir(), self.audios_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::io(format!("创建目录 {}", dir.display()), e))?;
        }
        Ok(())
    }
}

fn validate_segment(name: &str, value: &str) -> PipelineResult<()> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\');
    if invalid {
        return Err(PipelineError::invalid_argument(format!(
            "{} 不是合法的目录名: {:?}",
            name, value
        )));
    }
    Ok(())
}

/// 页面文件名：`<slide_no>.jpg`
pub fn page_file_name(slide_no: usize) -> String {
    format!("{}.jpg", slide_no)
}

/// 帧文件名：10 位补零的帧号
pub fn frame_file_name(frame_index: u64) -> String {
    format!("{:010}.jpg", frame_index)
}

/// 从帧文件名解析帧号（`0000000060.jpg` -> 60）
pub fn parse_frame_file_name(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// 把文件移动到目标位置；跨文件系统时退回到复制 + 删除
pub fn relocate_file(from: &Path, to: &Path) -> PipelineResult<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PipelineError::io(format!("创建目录 {}", parent.display()), e))?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).map_err(|e| {
        PipelineError::io(format!("复制 {} -> {}", from.display(), to.display()), e)
    })?;
    std::fs::remove_file(from)
        .map_err(|e| PipelineError::io(format!("删除 {}", from.display()), e))?;
    Ok(())
}
