//! 幻灯片与视频帧的对齐
//!
//! 每张幻灯片与全部候选帧逐一打分，取最高分 M，然后按时间顺序选出
//! **第一个** 分数不低于 `threshold × M` 的帧。幻灯片在显示期间画面/文字
//! 几乎不变，最早出现的时刻才是真正的切换点，因此这里不取 argmax。

use std::time::Instant;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::similarity::Scorer;
use crate::types::{AlignmentResult, MatchCandidate, SampledFrame, SlideImage};

pub struct AlignmentEngine<'a> {
    scorer: &'a dyn Scorer,
    /// 候选帧数量上限；超过时在整段视频上均匀抽稀，None 表示使用全部采样帧
    candidate_budget: Option<usize>,
    parallel: bool,
    cancel: CancellationToken,
}

impl<'a> AlignmentEngine<'a> {
    pub fn new(scorer: &'a dyn Scorer) -> Self {
        Self {
            scorer,
            candidate_budget: None,
            parallel: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_candidate_budget(mut self, budget: Option<usize>) -> Self {
        self.candidate_budget = budget;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 为每张幻灯片选出匹配帧，结果按幻灯片编号排列
    pub fn align(&self, slides: &[SlideImage], frames: &[SampledFrame]) -> PipelineResult<Vec<AlignmentResult>> {
        validate_inputs(slides, frames)?;

        let candidates = match self.candidate_budget {
            Some(budget) => {
                let thinned = thin_candidates(frames, budget)?;
                if thinned.len() < frames.len() {
                    warn!(
                        "⚠️  [幻灯片对齐] 候选帧按预算 {} 从 {} 帧均匀抽稀到 {} 帧",
                        budget,
                        frames.len(),
                        thinned.len()
                    );
                }
                thinned
            }
            None => frames.iter().collect(),
        };

        let start = Instant::now();
        info!(
            "⏳ [幻灯片对齐] {} 张幻灯片 × {} 个候选帧，接受阈值 {:.2}",
            slides.len(),
            candidates.len(),
            self.scorer.acceptance_threshold()
        );

        let align_one = |slide: &SlideImage| -> PipelineResult<AlignmentResult> {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage: Stage::Align });
            }
            let scored = self.score_slide(slide, &candidates)?;
            let chosen = select_earliest_acceptable(slide.slide_index, &scored, self.scorer.acceptance_threshold())?;
            debug!(
                "[幻灯片对齐] 幻灯片 {} -> 帧 {} ({:.2}s, 得分 {:.4})",
                slide.slide_index, chosen.frame_index, chosen.timestamp_seconds, chosen.score
            );
            Ok(AlignmentResult {
                slide_index: slide.slide_index,
                matched_frame_index: chosen.frame_index,
                matched_timestamp_seconds: chosen.timestamp_seconds,
                score: chosen.score,
            })
        };

        // rayon 的 collect 保持输入顺序
        let results: Vec<AlignmentResult> = if self.parallel {
            slides.par_iter().map(align_one).collect::<PipelineResult<_>>()?
        } else {
            slides.iter().map(align_one).collect::<PipelineResult<_>>()?
        };

        let violations = order_violations(&results);
        if !violations.is_empty() {
            warn!("⚠️  [幻灯片对齐] 以下幻灯片的匹配帧早于前一张: {:?}", violations);
        }
        info!(
            "✅ [幻灯片对齐] 完成，耗时: {:.2}秒",
            start.elapsed().as_secs_f64()
        );
        Ok(results)
    }

    /// 单张幻灯片对全部候选帧打分（按时间升序）
    pub fn score_slide(&self, slide: &SlideImage, candidates: &[&SampledFrame]) -> PipelineResult<Vec<MatchCandidate>> {
        candidates
            .iter()
            .map(|frame| {
                let score = self.scorer.score(slide, frame)?;
                Ok(MatchCandidate {
                    frame_index: frame.frame_index,
                    timestamp_seconds: frame.timestamp_seconds,
                    score,
                })
            })
            .collect()
    }
}

/// 按时间顺序选出第一个不低于 `threshold × max` 的候选
pub fn select_earliest_acceptable(
    slide_index: usize,
    candidates: &[MatchCandidate],
    threshold: f64,
) -> PipelineResult<MatchCandidate> {
    let max_score = candidates
        .iter()
        .map(|c| c.score)
        .filter(|s| s.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);

    let no_match = || PipelineError::Alignment {
        slide_index,
        candidates: candidates.len(),
        max_score: if max_score.is_finite() { max_score } else { 0.0 },
    };

    if !max_score.is_finite() {
        return Err(no_match());
    }

    let cutoff = threshold * max_score;
    candidates
        .iter()
        .find(|c| c.score.is_finite() && c.score >= cutoff)
        .copied()
        .ok_or_else(no_match)
}

/// 在整段序列上均匀选出至多 `budget` 个候选帧（保留首尾）
pub fn thin_candidates(frames: &[SampledFrame], budget: usize) -> PipelineResult<Vec<&SampledFrame>> {
    if budget == 0 {
        return Err(PipelineError::invalid_argument("候选帧预算必须大于 0"));
    }
    if frames.len() <= budget {
        return Ok(frames.iter().collect());
    }
    if budget == 1 {
        return Ok(vec![&frames[0]]);
    }

    let last = frames.len() - 1;
    let mut picked: Vec<&SampledFrame> = (0..budget)
        .map(|i| &frames[(i * last + (budget - 1) / 2) / (budget - 1)])
        .collect();
    picked.dedup_by_key(|f| f.frame_index);
    Ok(picked)
}

/// 匹配帧号早于前一张幻灯片的幻灯片编号
pub fn order_violations(results: &[AlignmentResult]) -> Vec<usize> {
    results
        .windows(2)
        .filter(|pair| pair[1].matched_frame_index < pair[0].matched_frame_index)
        .map(|pair| pair[1].slide_index)
        .collect()
}

fn validate_inputs(slides: &[SlideImage], frames: &[SampledFrame]) -> PipelineResult<()> {
    if slides.is_empty() {
        return Err(PipelineError::precondition(Stage::Align, "没有可对齐的幻灯片"));
    }
    if frames.is_empty() {
        return Err(PipelineError::precondition(Stage::Align, "没有采样到任何视频帧"));
    }
    for (position, slide) in slides.iter().enumerate() {
        if slide.slide_index != position + 1 {
            return Err(PipelineError::precondition(
                Stage::Align,
                format!("幻灯片编号不连续: 第 {} 张的编号为 {}", position + 1, slide.slide_index),
            ));
        }
    }
    for pair in frames.windows(2) {
        if pair[1].frame_index <= pair[0].frame_index || pair[1].timestamp_seconds < pair[0].timestamp_seconds {
            return Err(PipelineError::precondition(
                Stage::Align,
                format!("采样帧未按时间递增排列: 帧 {} 之后是帧 {}", pair[0].frame_index, pair[1].frame_index),
            ));
        }
    }
    Ok(())
}
