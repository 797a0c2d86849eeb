use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};

use crate::error::{PipelineError, PipelineResult};

/// 图像比较前统一缩放的边长
pub const COMPARE_SIZE: u32 = 256;

/// 比值检验默认阈值
pub const DEFAULT_RATIO_THRESH: f64 = 0.7;

const SSIM_WINDOW: u32 = 7;
const HARRIS_K: f64 = 0.04;
/// 描述子取关键点周围 (2r+1)x(2r+1) 的像素块
const PATCH_RADIUS: u32 = 4;

/// 缩放到统一尺寸的灰度图
pub fn prepare(image: &DynamicImage) -> GrayImage {
    image.resize_exact(COMPARE_SIZE, COMPARE_SIZE, FilterType::Triangle).to_luma8()
}

fn ensure_non_empty(name: &str, image: &GrayImage) -> PipelineResult<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::invalid_argument(format!("{} 为空图像", name)));
    }
    Ok(())
}

/// 结构相似度（平均 SSIM），两张图尺寸必须一致；结果大致在 [-1, 1]
pub fn ssim(a: &GrayImage, b: &GrayImage) -> PipelineResult<f64> {
    ensure_non_empty("image_a", a)?;
    ensure_non_empty("image_b", b)?;
    if a.dimensions() != b.dimensions() {
        return Err(PipelineError::invalid_argument(format!(
            "SSIM 需要尺寸一致的图像: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let (width, height) = a.dimensions();
    let win = SSIM_WINDOW.min(width).min(height) as usize;
    let (w, h) = (width as usize, height as usize);

    // 积分图：x, y, x², y², xy
    let stride = w + 1;
    let mut sums = vec![[0.0f64; 5]; stride * (h + 1)];
    for y in 0..h {
        let mut row = [0.0f64; 5];
        for x in 0..w {
            let px = a.get_pixel(x as u32, y as u32)[0] as f64;
            let py = b.get_pixel(x as u32, y as u32)[0] as f64;
            let values = [px, py, px * px, py * py, px * py];
            for k in 0..5 {
                row[k] += values[k];
                sums[(y + 1) * stride + x + 1][k] = sums[y * stride + x + 1][k] + row[k];
            }
        }
    }

    let window_sum = |x0: usize, y0: usize, k: usize| {
        let (x1, y1) = (x0 + win, y0 + win);
        sums[y1 * stride + x1][k] - sums[y0 * stride + x1][k] - sums[y1 * stride + x0][k]
            + sums[y0 * stride + x0][k]
    };

    let c1 = (0.01f64 * 255.0).powi(2);
    let c2 = (0.03f64 * 255.0).powi(2);
    let n = (win * win) as f64;
    // 样本协方差修正
    let cov_norm = if n > 1.0 { n / (n - 1.0) } else { 1.0 };

    let mut total = 0.0;
    let mut count = 0usize;
    for y0 in 0..=(h - win) {
        for x0 in 0..=(w - win) {
            let mu_x = window_sum(x0, y0, 0) / n;
            let mu_y = window_sum(x0, y0, 1) / n;
            let var_x = cov_norm * (window_sum(x0, y0, 2) / n - mu_x * mu_x);
            let var_y = cov_norm * (window_sum(x0, y0, 3) / n - mu_y * mu_y);
            let cov_xy = cov_norm * (window_sum(x0, y0, 4) / n - mu_x * mu_y);

            let numerator = (2.0 * mu_x * mu_y + c1) * (2.0 * cov_xy + c2);
            let denominator = (mu_x * mu_x + mu_y * mu_y + c1) * (var_x + var_y + c2);
            total += numerator / denominator;
            count += 1;
        }
    }

    Ok(total / count as f64)
}

/// 关键点及其描述子
#[derive(Debug, Clone)]
pub struct Keypoint {
    pub x: u32,
    pub y: u32,
    pub response: f64,
    pub descriptor: Vec<f32>,
}

/// 基于 Harris 角点和像素块描述子的关键点匹配
#[derive(Debug, Clone)]
pub struct KeypointMatcher {
    ratio_thresh: f64,
    symmetric: bool,
    max_keypoints: usize,
}

impl KeypointMatcher {
    /// `ratio_thresh` 必须在 [0, 1] 之间，越小越严格
    pub fn new(ratio_thresh: f64) -> PipelineResult<Self> {
        if !(0.0..=1.0).contains(&ratio_thresh) {
            return Err(PipelineError::invalid_argument(format!(
                "ratio_thresh 必须在 0 到 1 之间: {}",
                ratio_thresh
            )));
        }
        Ok(Self {
            ratio_thresh,
            symmetric: true,
            max_keypoints: 500,
        })
    }

    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    pub fn max_keypoints(mut self, max_keypoints: usize) -> Self {
        self.max_keypoints = max_keypoints;
        self
    }

    /// 匹配比例：对称时为 (A→B + B→A) / (kpA + kpB)，
    /// 否则为 min(1, 2·(A→B) / (kpA + kpB))；任一图关键点少于 2 个返回 0
    pub fn score(&self, a: &GrayImage, b: &GrayImage) -> PipelineResult<f64> {
        ensure_non_empty("image_a", a)?;
        ensure_non_empty("image_b", b)?;

        let keypoints_a = self.detect(a);
        let keypoints_b = self.detect(b);
        let (count_a, count_b) = (keypoints_a.len(), keypoints_b.len());
        if count_a < 2 || count_b < 2 {
            return Ok(0.0);
        }

        let forward = self.count_good_matches(&keypoints_a, &keypoints_b);
        let total = (count_a + count_b) as f64;
        if self.symmetric {
            let backward = self.count_good_matches(&keypoints_b, &keypoints_a);
            Ok((forward + backward) as f64 / total)
        } else {
            // 模糊图像下可能超过 1
            Ok((2.0 * forward as f64 / total).min(1.0))
        }
    }

    /// 比值检验：最近距离 < ratio_thresh × 次近距离
    fn count_good_matches(&self, from: &[Keypoint], to: &[Keypoint]) -> usize {
        from.iter()
            .filter(|kp| {
                let mut best = f32::INFINITY;
                let mut second = f32::INFINITY;
                for other in to {
                    let d = descriptor_distance(&kp.descriptor, &other.descriptor);
                    if d < best {
                        second = best;
                        best = d;
                    } else if d < second {
                        second = d;
                    }
                }
                (best as f64) < self.ratio_thresh * second as f64
            })
            .count()
    }

    /// 检测 Harris 角点并提取归一化的像素块描述子
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (width, height) = image.dimensions();
        let margin = PATCH_RADIUS + 1;
        if width <= 2 * margin || height <= 2 * margin {
            return Vec::new();
        }

        let response = harris_response(image);
        let w = width as usize;
        let max_response = response.iter().cloned().fold(0.0f64, f64::max);
        if max_response <= 0.0 {
            return Vec::new();
        }
        let threshold = max_response * 0.01;

        let mut keypoints = Vec::new();
        for y in margin..(height - margin) {
            for x in margin..(width - margin) {
                let r = response[y as usize * w + x as usize];
                if r <= threshold || !is_local_maximum(&response, w, x, y, r) {
                    continue;
                }
                if let Some(descriptor) = patch_descriptor(image, x, y) {
                    keypoints.push(Keypoint {
                        x,
                        y,
                        response: r,
                        descriptor,
                    });
                }
            }
        }

        keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
        keypoints.truncate(self.max_keypoints);
        keypoints
    }
}

fn descriptor_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn harris_response(image: &GrayImage) -> Vec<f64> {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let px = |x: usize, y: usize| image.get_pixel(x as u32, y as u32)[0] as f64;

    // Sobel 梯度
    let mut ixx = vec![0.0; w * h];
    let mut iyy = vec![0.0; w * h];
    let mut ixy = vec![0.0; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            let i = y * w + x;
            ixx[i] = gx * gx;
            iyy[i] = gy * gy;
            ixy[i] = gx * gy;
        }
    }

    let mut response = vec![0.0; w * h];
    for y in 2..h - 2 {
        for x in 2..w - 2 {
            let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
            for dy in 0..3 {
                for dx in 0..3 {
                    let i = (y + dy - 1) * w + (x + dx - 1);
                    sxx += ixx[i];
                    syy += iyy[i];
                    sxy += ixy[i];
                }
            }
            let det = sxx * syy - sxy * sxy;
            let trace = sxx + syy;
            response[y * w + x] = det - HARRIS_K * trace * trace;
        }
    }
    response
}

fn is_local_maximum(response: &[f64], w: usize, x: u32, y: u32, value: f64) -> bool {
    let (x, y) = (x as usize, y as usize);
    for ny in y - 1..=y + 1 {
        for nx in x - 1..=x + 1 {
            if (nx, ny) == (x, y) {
                continue;
            }
            let other = response[ny * w + nx];
            // 平台区域只保留扫描顺序上的第一个点
            if other > value || (other == value && (ny, nx) < (y, x)) {
                return false;
            }
        }
    }
    true
}

/// 均值为 0、L2 归一化的像素块；纯色块返回 None
fn patch_descriptor(image: &GrayImage, cx: u32, cy: u32) -> Option<Vec<f32>> {
    let r = PATCH_RADIUS;
    let mut patch = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for y in cy - r..=cy + r {
        for x in cx - r..=cx + r {
            patch.push(image.get_pixel(x, y)[0] as f32);
        }
    }
    let mean = patch.iter().sum::<f32>() / patch.len() as f32;
    for v in patch.iter_mut() {
        *v -= mean;
    }
    let norm = patch.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-3 {
        return None;
    }
    for v in patch.iter_mut() {
        *v /= norm;
    }
    Some(patch)
}
