use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use slide_align::config::{ConfigLoader, PartialConfig};
use slide_align::ocr::{ContentExtractor, TesseractRecognizer};
use slide_align::processor::system_frame_source;
use slide_align::similarity::{score_images, ImageMethod, KeypointMatcher, DEFAULT_RATIO_THRESH};
use slide_align::{
    align_slides_to_video, score_text, AlignmentRequest, Capabilities, FrameSampler, FrameStore, MatchMode,
};

/// 幻灯片对齐工具 - 找出每张幻灯片在讲课视频中出现的时间并切分字幕/音频
#[derive(Parser, Debug)]
#[command(name = "slide-align")]
#[command(about = "幻灯片对齐工具：把幻灯片对齐到讲课视频，输出每页的时间段、字幕和音频", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 对齐幻灯片与视频
    Align {
        /// 幻灯片文档（PDF）
        #[arg(short, long)]
        document: PathBuf,

        /// 讲课视频
        #[arg(short, long)]
        video: PathBuf,

        /// 用户 ID（存储命名空间）
        #[arg(short, long)]
        user: String,

        /// 项目 ID（存储命名空间）
        #[arg(short, long)]
        project: String,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 存储根目录
        /// 可通过环境变量 SLIDE_ALIGN_STORAGE_ROOT 或配置文件设置
        #[arg(long)]
        storage_root: Option<PathBuf>,

        /// 抽帧间隔（帧）
        #[arg(long)]
        interval: Option<u64>,

        /// 匹配方式：text / ssim / keypoints
        #[arg(long)]
        mode: Option<MatchMode>,

        /// 当前匹配方式的接受阈值 (0.0-1.0]
        #[arg(long)]
        threshold: Option<f64>,

        /// 候选帧数量上限（在整段视频上均匀抽稀）
        #[arg(long)]
        candidate_budget: Option<usize>,

        /// 整体超时（秒）
        #[arg(long)]
        timeout: Option<u64>,

        /// 页面已渲染到 pdf_pages/，跳过光栅化
        #[arg(long)]
        pages_ready: bool,

        /// 重新写入已存在的视频帧
        #[arg(long)]
        overwrite: bool,
    },
    /// 只执行视频抽帧
    Sample {
        #[arg(short, long)]
        video: PathBuf,

        /// 帧输出目录
        #[arg(short, long)]
        output_dir: PathBuf,

        #[arg(long, default_value_t = 60)]
        interval: u64,

        #[arg(long)]
        overwrite: bool,
    },
    /// 比较两张图片的相似度
    Compare {
        #[arg(long)]
        first: PathBuf,

        #[arg(long)]
        second: PathBuf,

        /// text（先 OCR 再比较文字）/ ssim / keypoints
        #[arg(long, default_value_t = MatchMode::Text)]
        method: MatchMode,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(short, long, default_value = "slide-align.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Align {
            document,
            video,
            user,
            project,
            config: config_file,
            storage_root,
            interval,
            mode,
            threshold,
            candidate_budget,
            timeout,
            pages_ready,
            overwrite,
        } => {
            let cli = PartialConfig {
                storage_root,
                sampling_interval: interval,
                match_mode: mode,
                threshold,
                candidate_budget,
                timeout_secs: timeout,
                overwrite_frames: overwrite.then_some(true),
                ..Default::default()
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), cli).context("加载配置失败")?;
            init_logging(&config.log_level);

            tracing::info!(
                "使用配置: mode={}, interval={}, threshold={:.2}, storage_root={}",
                config.match_mode,
                config.sampling_interval,
                config.acceptance_threshold(),
                config.storage_root.display()
            );

            let capabilities = Capabilities::system(&config, pages_ready).context("初始化外部工具失败")?;
            let cancel = cancel_on_ctrl_c();
            let request = AlignmentRequest {
                document,
                video,
                user_id: user,
                project_id: project,
            };

            let output = align_slides_to_video(request, &config, &capabilities, cancel)
                .await
                .context("幻灯片对齐失败")?;
            println!("{}", serde_json::to_string_pretty(&output.records)?);
        }
        Commands::Sample {
            video,
            output_dir,
            interval,
            overwrite,
        } => {
            init_logging(&log_level_from_env());
            let source = system_frame_source().context("初始化视频解码失败")?;
            let cancel = cancel_on_ctrl_c();
            let report = tokio::task::spawn_blocking(move || {
                FrameSampler::new(source.as_ref(), FrameStore::new(output_dir, overwrite), interval)
                    .with_cancellation(cancel)
                    .sample(&video)
            })
            .await
            .context("抽帧任务异常退出")?
            .context("视频抽帧失败")?;
            println!(
                "抽帧完成: 策略 {:?}，目标 {} 帧，写入 {} 帧，跳过 {} 帧",
                report.plan.strategy,
                report.plan.indices.len(),
                report.written,
                report.skipped
            );
        }
        Commands::Compare { first, second, method } => {
            init_logging(&log_level_from_env());
            let score = compare(&first, &second, method)?;
            println!("{:.6}", score);
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path).context("生成配置文件失败")?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn compare(first: &Path, second: &Path, method: MatchMode) -> Result<f64> {
    let score = match method {
        MatchMode::Text => {
            let recognizer = TesseractRecognizer::new();
            let extractor = ContentExtractor::new(&recognizer);
            let a = extractor.extract_text(first).context("识别第一张图片失败")?;
            let b = extractor.extract_text(second).context("识别第二张图片失败")?;
            score_text(&a, &b)
        }
        MatchMode::Ssim | MatchMode::Keypoints => {
            let a = image::open(first).with_context(|| format!("读取图片失败: {}", first.display()))?;
            let b = image::open(second).with_context(|| format!("读取图片失败: {}", second.display()))?;
            let image_method = if method == MatchMode::Ssim {
                ImageMethod::Ssim
            } else {
                ImageMethod::Keypoints(KeypointMatcher::new(DEFAULT_RATIO_THRESH)?)
            };
            score_images(&a, &b, &image_method)?
        }
    };
    Ok(score)
}

fn init_logging(level: &str) {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn log_level_from_env() -> String {
    std::env::var("SLIDE_ALIGN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

/// Ctrl-C 触发协作式取消
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠️  收到中断信号，正在取消...");
            token.cancel();
        }
    });
    cancel
}
