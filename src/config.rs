use anyhow::{bail, Context, Result};
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::processor::AlignConfig;
use crate::similarity::MatchMode;

const SECTION: &str = "slide_align";
const ENV_PREFIX: &str = "SLIDE_ALIGN_";

/// 某一来源提供的配置项（未提供的为 None）
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub storage_root: Option<PathBuf>,
    pub sampling_interval: Option<u64>,
    pub overwrite_frames: Option<bool>,
    pub match_mode: Option<MatchMode>,
    pub text_threshold: Option<f64>,
    pub image_threshold: Option<f64>,
    /// 只作用于当前匹配方式的阈值（命令行 `--threshold`）
    pub threshold: Option<f64>,
    pub ratio_thresh: Option<f64>,
    pub symmetric_match: Option<bool>,
    pub candidate_budget: Option<usize>,
    pub render_dpi: Option<u32>,
    pub parallel: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub ocr_language: Option<String>,
    pub webhook_url: Option<String>,
    pub log_level: Option<String>,
}

impl PartialConfig {
    /// 以 self 为准，缺失的项由 `lower` 补齐
    pub fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            storage_root: self.storage_root.or(lower.storage_root),
            sampling_interval: self.sampling_interval.or(lower.sampling_interval),
            overwrite_frames: self.overwrite_frames.or(lower.overwrite_frames),
            match_mode: self.match_mode.or(lower.match_mode),
            text_threshold: self.text_threshold.or(lower.text_threshold),
            image_threshold: self.image_threshold.or(lower.image_threshold),
            threshold: self.threshold.or(lower.threshold),
            ratio_thresh: self.ratio_thresh.or(lower.ratio_thresh),
            symmetric_match: self.symmetric_match.or(lower.symmetric_match),
            candidate_budget: self.candidate_budget.or(lower.candidate_budget),
            render_dpi: self.render_dpi.or(lower.render_dpi),
            parallel: self.parallel.or(lower.parallel),
            timeout_secs: self.timeout_secs.or(lower.timeout_secs),
            ocr_language: self.ocr_language.or(lower.ocr_language),
            webhook_url: self.webhook_url.or(lower.webhook_url),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    /// 用默认值补齐剩余项
    pub fn resolve(self) -> AlignConfig {
        let defaults = AlignConfig::default();
        let mut config = AlignConfig {
            storage_root: self.storage_root.unwrap_or(defaults.storage_root),
            sampling_interval: self.sampling_interval.unwrap_or(defaults.sampling_interval),
            overwrite_frames: self.overwrite_frames.unwrap_or(defaults.overwrite_frames),
            match_mode: self.match_mode.unwrap_or(defaults.match_mode),
            text_threshold: self.text_threshold.unwrap_or(defaults.text_threshold),
            image_threshold: self.image_threshold.unwrap_or(defaults.image_threshold),
            ratio_thresh: self.ratio_thresh.unwrap_or(defaults.ratio_thresh),
            symmetric_match: self.symmetric_match.unwrap_or(defaults.symmetric_match),
            candidate_budget: self.candidate_budget.or(defaults.candidate_budget),
            render_dpi: self.render_dpi.unwrap_or(defaults.render_dpi),
            parallel: self.parallel.unwrap_or(defaults.parallel),
            timeout_secs: self.timeout_secs.or(defaults.timeout_secs),
            ocr_language: self.ocr_language.or(defaults.ocr_language),
            webhook_url: self.webhook_url.or(defaults.webhook_url),
            log_level: self.log_level.unwrap_or(defaults.log_level),
        };
        if let Some(threshold) = self.threshold {
            if config.match_mode.is_image() {
                config.image_threshold = threshold;
            } else {
                config.text_threshold = threshold;
            }
        }
        config
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, cli: PartialConfig) -> Result<AlignConfig> {
        // 1. 配置文件：显式指定时必须存在，否则尝试默认位置
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations()?.unwrap_or_default(),
        };

        // 2. 环境变量
        let env_config = Self::load_from_env()?;

        // 3. 合并并校验
        let config = cli.or(env_config).or(file_config).resolve();
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    /// 从环境变量加载配置
    pub fn load_from_env() -> Result<PartialConfig> {
        Self::load_from_lookup(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// 从任意键值来源读取配置（键名为大写，不含前缀）
    fn load_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<PartialConfig> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(PartialConfig {
            storage_root: get("STORAGE_ROOT").map(PathBuf::from),
            sampling_interval: parse_opt("INTERVAL", get("INTERVAL"))?,
            overwrite_frames: parse_bool_opt("OVERWRITE_FRAMES", get("OVERWRITE_FRAMES"))?,
            match_mode: parse_opt("MATCH_MODE", get("MATCH_MODE"))?,
            text_threshold: parse_opt("TEXT_THRESHOLD", get("TEXT_THRESHOLD"))?,
            image_threshold: parse_opt("IMAGE_THRESHOLD", get("IMAGE_THRESHOLD"))?,
            threshold: None,
            ratio_thresh: parse_opt("RATIO_THRESH", get("RATIO_THRESH"))?,
            symmetric_match: parse_bool_opt("SYMMETRIC_MATCH", get("SYMMETRIC_MATCH"))?,
            candidate_budget: parse_opt("CANDIDATE_BUDGET", get("CANDIDATE_BUDGET"))?,
            render_dpi: parse_opt("RENDER_DPI", get("RENDER_DPI"))?,
            parallel: parse_bool_opt("PARALLEL", get("PARALLEL"))?,
            timeout_secs: parse_opt("TIMEOUT_SECS", get("TIMEOUT_SECS"))?,
            ocr_language: get("OCR_LANGUAGE"),
            webhook_url: get("WEBHOOK_URL"),
            log_level: get("LOG_LEVEL"),
        })
    }

    /// 从INI配置文件加载配置
    pub fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            bail!("配置文件不存在: {}", config_path.display());
        }

        let mut config_parser = Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        Self::from_ini(&config_parser)
            .with_context(|| format!("解析配置文件失败: {}", config_path.display()))
    }

    fn from_ini(config_parser: &Ini) -> Result<PartialConfig> {
        // 先读 [slide_align] 节，没有则使用 [DEFAULT] 节
        let mut partial = Self::load_from_lookup(|key| {
            let key = key.to_lowercase();
            config_parser
                .get(SECTION, &key)
                .or_else(|| config_parser.get("DEFAULT", &key))
        })?;

        let log_level = config_parser
            .get("logging", "level")
            .filter(|v| !v.is_empty());
        partial.log_level = log_level.or(partial.log_level);
        Ok(partial)
    }

    /// 从默认位置加载配置文件；都不存在时返回 None
    fn load_from_default_locations() -> Result<Option<PartialConfig>> {
        for candidate in Self::default_locations() {
            if candidate.exists() {
                return Self::load_from_file(&candidate).map(Some);
            }
        }
        Ok(None)
    }

    /// 当前目录 > 当前目录隐藏文件 > 用户主目录 > /etc
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from("slide-align.ini"), PathBuf::from(".slide-align.ini")];
        if let Some(home) = env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(".slide-align.ini"));
        }
        locations.push(PathBuf::from("/etc/slide-align.ini"));
        locations
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AlignConfig::default();
        let mut config_parser = Ini::new();
        let mut set = |key: &str, value: String| {
            config_parser.set(SECTION, key, Some(value));
        };
        set("storage_root", defaults.storage_root.display().to_string());
        set("interval", defaults.sampling_interval.to_string());
        set("overwrite_frames", defaults.overwrite_frames.to_string());
        set("match_mode", defaults.match_mode.to_string());
        set("text_threshold", defaults.text_threshold.to_string());
        set("image_threshold", defaults.image_threshold.to_string());
        set("ratio_thresh", defaults.ratio_thresh.to_string());
        set("symmetric_match", defaults.symmetric_match.to_string());
        set("candidate_budget", String::new());
        set("render_dpi", defaults.render_dpi.to_string());
        set("parallel", defaults.parallel.to_string());
        set("timeout_secs", String::new());
        set("ocr_language", String::new());
        set("webhook_url", String::new());
        config_parser.set("logging", "level", Some(defaults.log_level));

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }
        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn parse_opt<T>(key: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("配置项 {} 的值无效 {:?}: {}", key, v, e))
        })
        .transpose()
}

fn parse_bool_opt(key: &str, value: Option<String>) -> Result<Option<bool>> {
    value
        .map(|v| match v.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("配置项 {} 的值无效 {:?}: 需要 true/false", key, v)),
        })
        .transpose()
}
