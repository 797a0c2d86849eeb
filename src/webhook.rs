use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

use crate::types::{AlignmentMetadata, SlideRecord};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// 对齐完成后回调的请求体
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub status: &'static str,
    pub run_id: &'a str,
    pub document: &'a str,
    pub video: &'a str,
    pub slide_count: usize,
    pub sampled_frame_count: usize,
    pub order_violations: &'a [usize],
    pub elapsed_seconds: f64,
    pub slides: &'a [SlideRecord],
    /// RFC 3339 时间戳
    pub timestamp: String,
}

impl<'a> WebhookPayload<'a> {
    pub fn success(metadata: &'a AlignmentMetadata) -> Self {
        Self {
            status: "success",
            run_id: &metadata.run_id,
            document: &metadata.document,
            video: &metadata.video,
            slide_count: metadata.slide_count,
            sampled_frame_count: metadata.sampled_frame_count,
            order_violations: &metadata.order_violations,
            elapsed_seconds: metadata.elapsed_seconds,
            slides: &metadata.slides,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// 调用 webhook 回调
pub async fn call_webhook(webhook_url: &str, metadata: &AlignmentMetadata) -> Result<()> {
    let payload = WebhookPayload::success(metadata);

    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(&payload)
        .timeout(WEBHOOK_TIMEOUT)
        .send()
        .await
        .context("Webhook 请求失败")?;

    let status = response.status();
    if status.is_success() {
        tracing::info!("Webhook 回调成功: {}", webhook_url);
        Ok(())
    } else {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!("Webhook 回调返回错误状态: {} - {}", status, error_text);
        Err(anyhow::anyhow!("Webhook 返回错误状态: {}", status))
    }
}
