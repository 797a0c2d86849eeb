//! 文档光栅化
//!
//! 每一页输出为 `pdf_pages/<n>.jpg`，n 从 1 开始。渲染交给外部工具
//! （poppler 的 `pdftoppm`），也可以直接使用已经渲染好的页面。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use crate::error::{ExtractionTarget, PipelineError, PipelineResult, Stage};
use crate::storage::{page_file_name, relocate_file};

/// PDF 默认渲染分辨率
pub const DEFAULT_RENDER_DPI: u32 = 500;

pub trait Rasterizer: Send + Sync {
    /// 把文档渲染到 `pages_dir`，按页码顺序返回页面图片路径
    fn rasterize(&self, document: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>>;
}

#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
    dpi: u32,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pdftoppm"),
            dpi: DEFAULT_RENDER_DPI,
        }
    }
}

impl PdftoppmRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi,
            ..Self::default()
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn rasterize(&self, document: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        if !document.is_file() {
            return Err(PipelineError::precondition(
                Stage::Rasterize,
                format!("文档不存在: {}", document.display()),
            ));
        }

        let start = Instant::now();
        info!("⏳ [文档光栅化] 正在渲染 {}（{} dpi）...", document.display(), self.dpi);

        // 先渲染到临时目录，再改名为 <n>.jpg
        let render_dir = pages_dir.join(format!(".render-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&render_dir)
            .map_err(|e| PipelineError::io(format!("创建目录 {}", render_dir.display()), e))?;

        let result = self.render_into(document, &render_dir, pages_dir);
        let _ = std::fs::remove_dir_all(&render_dir);
        let pages = result?;

        info!(
            "✅ [文档光栅化] 渲染完成，共 {} 页，耗时: {:.2}秒",
            pages.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(pages)
    }
}

impl PdftoppmRasterizer {
    fn render_into(&self, document: &Path, render_dir: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let output = Command::new(&self.binary)
            .arg("-jpeg")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(document)
            .arg(render_dir.join("page"))
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => PipelineError::CapabilityUnavailable {
                    capability: "pdftoppm",
                    source: e,
                },
                _ => PipelineError::extraction(Stage::Rasterize, ExtractionTarget::Path(document.to_path_buf()), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::extraction(
                Stage::Rasterize,
                ExtractionTarget::Path(document.to_path_buf()),
                format!("pdftoppm 退出码 {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        // pdftoppm 输出 page-1.jpg / page-01.jpg / page-001.jpg，位数取决于总页数
        let mut rendered: Vec<(usize, PathBuf)> = read_dir_files(render_dir)?
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                let number = stem.rsplit('-').next()?.parse().ok()?;
                Some((number, path))
            })
            .collect();
        rendered.sort();

        if rendered.is_empty() {
            return Err(PipelineError::extraction(
                Stage::Rasterize,
                ExtractionTarget::Path(document.to_path_buf()),
                "pdftoppm 没有输出任何页面",
            ));
        }

        clear_pages(pages_dir)?;
        let mut pages = Vec::with_capacity(rendered.len());
        for (number, path) in rendered {
            let target = pages_dir.join(page_file_name(number));
            relocate_file(&path, &target)?;
            pages.push(target);
        }
        Ok(pages)
    }
}

/// 直接使用 `pages_dir` 中已存在的 `<n>.jpg`
#[derive(Debug, Clone, Default)]
pub struct ExistingPagesRasterizer;

impl Rasterizer for ExistingPagesRasterizer {
    fn rasterize(&self, _document: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let pages = list_pages(pages_dir)?;
        if pages.is_empty() {
            return Err(PipelineError::precondition(
                Stage::Rasterize,
                format!("目录中没有页面图片: {}", pages_dir.display()),
            ));
        }
        info!("✅ [文档光栅化] 使用已有页面 {} 页", pages.len());
        Ok(pages)
    }
}

/// 按页码数值排序列出 `<n>.jpg`（`10.jpg` 排在 `9.jpg` 之后）
pub fn list_pages(pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !pages_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut numbered: Vec<(u64, PathBuf)> = read_dir_files(pages_dir)?
        .into_iter()
        .filter_map(|path| page_number(&path).map(|n| (n, path)))
        .collect();
    numbered.sort();
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

fn page_number(path: &Path) -> Option<u64> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case("jpg") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn clear_pages(pages_dir: &Path) -> PipelineResult<()> {
    for page in list_pages(pages_dir)? {
        std::fs::remove_file(&page).map_err(|e| PipelineError::io(format!("删除 {}", page.display()), e))?;
    }
    Ok(())
}

fn read_dir_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(format!("读取目录 {}", dir.display()), e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(format!("读取目录 {}", dir.display()), e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_pages_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10.jpg", "2.jpg", "1.jpg", "notes.txt", "cover.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let pages = list_pages(dir.path()).unwrap();
        let names: Vec<_> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["1.jpg", "2.jpg", "10.jpg"]);
    }

    #[test]
    fn test_existing_pages_requires_pages() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExistingPagesRasterizer
            .rasterize(Path::new("deck.pdf"), dir.path())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition { stage: Stage::Rasterize, .. }));
    }

    #[test]
    fn test_missing_document_is_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let err = PdftoppmRasterizer::default()
            .rasterize(&dir.path().join("missing.pdf"), dir.path())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition { stage: Stage::Rasterize, .. }));
    }

    #[test]
    fn test_missing_pdftoppm_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("deck.pdf");
        std::fs::write(&document, b"%PDF-1.4").unwrap();

        let err = PdftoppmRasterizer::new(150)
            .with_binary(dir.path().join("no-such-pdftoppm"))
            .rasterize(&document, &dir.path().join("pages"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CapabilityUnavailable { capability: "pdftoppm", .. }));
        // 临时渲染目录已清理
        let leftovers = std::fs::read_dir(dir.path().join("pages")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
