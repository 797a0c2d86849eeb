use std::collections::BTreeSet;
use std::path::Path;

use ffmpeg_next as ffmpeg;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::sampler::FrameSource;
use crate::types::VideoInfo;

static FFMPEG_INIT: OnceCell<Result<(), String>> = OnceCell::new();

/// 基于 FFmpeg 库的帧源，负责探测视频信息并按帧号解码
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegFrameSource;

impl FfmpegFrameSource {
    pub fn new() -> PipelineResult<Self> {
        init_once(&FFMPEG_INIT, || {
            ffmpeg::init().map_err(|e| e.to_string())?;
            // 只输出错误和致命错误
            unsafe {
                ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
            }
            Ok(())
        })?;
        Ok(Self)
    }

    fn open(&self, video: &Path) -> PipelineResult<ffmpeg::format::context::Input> {
        ffmpeg::format::input(&video)
            .map_err(|e| PipelineError::decode(format!("无法打开视频文件 {}: {}", video.display(), e)))
    }

    /// 顺序解码整段视频；帧号按解码顺序从 0 计数
    fn decode_with<F>(&self, video: &Path, wanted: &dyn Fn(u64) -> bool, mut on_frame: F) -> PipelineResult<()>
    where
        F: FnMut(u64, DynamicImage) -> PipelineResult<bool>,
    {
        let mut ictx = self.open(video)?;
        let stream_index = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::decode("未找到视频流"))?
            .index();

        let parameters = ictx
            .stream(stream_index)
            .ok_or_else(|| PipelineError::decode("视频流不存在"))?
            .parameters();
        let mut decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| PipelineError::decode(format!("无法创建视频解码器: {}", e)))?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| PipelineError::decode(format!("无法创建缩放器: {}", e)))?;

        let mut frame_index: u64 = 0;
        let mut keep_going = true;

        let mut drain = |decoder: &mut ffmpeg::decoder::Video,
                         frame_index: &mut u64,
                         keep_going: &mut bool|
         -> PipelineResult<()> {
            let mut decoded = ffmpeg::frame::Video::empty();
            while *keep_going && decoder.receive_frame(&mut decoded).is_ok() {
                let index = *frame_index;
                *frame_index += 1;
                if !wanted(index) {
                    continue;
                }
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| PipelineError::decode(format!("帧 {} 颜色转换失败: {}", index, e)))?;
                *keep_going = on_frame(index, frame_to_image(&rgb_frame))?;
            }
            Ok(())
        };

        for (stream, packet) in ictx.packets() {
            if !keep_going {
                break;
            }
            if stream.index() != stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                debug!("[视频抽帧] 跳过无法解码的数据包（已解码 {} 帧）", frame_index);
                continue;
            }
            drain(&mut decoder, &mut frame_index, &mut keep_going)?;
        }

        if keep_going {
            decoder
                .send_eof()
                .map_err(|e| PipelineError::decode(format!("刷新解码器失败: {}", e)))?;
            drain(&mut decoder, &mut frame_index, &mut keep_going)?;
        }
        Ok(())
    }
}

impl FrameSource for FfmpegFrameSource {
    fn probe(&self, video: &Path) -> PipelineResult<VideoInfo> {
        let ictx = self.open(video)?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::decode("未找到视频流"))?;

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| PipelineError::decode(format!("无法创建视频解码器: {}", e)))?;

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0 // 默认值
        };

        let duration_seconds = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            let time_base = stream.time_base();
            stream.duration() as f64 * time_base.numerator() as f64 / time_base.denominator().max(1) as f64
        };

        // 部分容器不记录帧数，按时长估算
        let frame_count = if stream.frames() > 0 {
            stream.frames() as u64
        } else {
            (duration_seconds * fps).floor().max(0.0) as u64
        };

        Ok(VideoInfo {
            fps,
            frame_count,
            duration_seconds,
            width: decoder.width(),
            height: decoder.height(),
        })
    }

    fn decode_batch(&self, video: &Path, indices: &[u64]) -> PipelineResult<Vec<(u64, DynamicImage)>> {
        let targets: BTreeSet<u64> = indices.iter().copied().collect();
        let Some(&last) = targets.iter().next_back() else {
            return Ok(Vec::new());
        };

        let mut frames = Vec::with_capacity(targets.len());
        let wanted = |index: u64| targets.contains(&index);
        self.decode_with(video, &wanted, |index, image| {
            frames.push((index, image));
            // 取到最后一个目标帧后提前结束
            Ok(index < last)
        })?;
        Ok(frames)
    }

    fn decode_stream(
        &self,
        video: &Path,
        wanted: &(dyn Fn(u64) -> bool + Sync),
        sink: &mut dyn FnMut(u64, DynamicImage) -> PipelineResult<()>,
    ) -> PipelineResult<()> {
        self.decode_with(video, wanted, |index, image| {
            sink(index, image)?;
            Ok(true)
        })
    }
}

/// 将 RGB24 格式的 FFmpeg 帧转换为 DynamicImage
fn frame_to_image(frame: &ffmpeg::frame::Video) -> DynamicImage {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut img_buf = image::RgbImage::new(width, height);
    for y in 0..height {
        let row = y as usize * stride;
        for x in 0..width {
            let idx = row + x as usize * 3;
            if idx + 2 < data.len() {
                img_buf.put_pixel(x, y, image::Rgb([data[idx], data[idx + 1], data[idx + 2]]));
            }
        }
    }
    DynamicImage::ImageRgb8(img_buf)
}

/// 只初始化一次，之后每次调用都返回第一次的结果
fn init_once<F>(cell: &OnceCell<Result<(), String>>, init: F) -> PipelineResult<()>
where
    F: FnOnce() -> Result<(), String>,
{
    cell.get_or_init(init)
        .clone()
        .map_err(|e| PipelineError::decode(format!("初始化 FFmpeg 失败: {}", e)))
}
