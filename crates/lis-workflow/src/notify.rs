//! 结果就绪通知
//!
//! 通知服务是外部协作方, 这里只定义接口与两个实现:
//! 日志通知(默认)与Webhook通知。通知以后台任务尽力投递,
//! 投递失败不影响审核操作本身。

use async_trait::async_trait;
use lis_core::{LisError, Result};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// 结果就绪通知接口
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify_result_ready(&self, order_id: Uuid, triggered_by: Uuid) -> Result<()>;
}

/// 仅记录日志的通知实现
pub struct LoggingNotifier;

#[async_trait]
impl ResultNotifier for LoggingNotifier {
    async fn notify_result_ready(&self, order_id: Uuid, triggered_by: Uuid) -> Result<()> {
        info!(
            "result ready notification for order {} (triggered by {})",
            order_id, triggered_by
        );
        Ok(())
    }
}

/// 向外部通知服务POST事件的Webhook实现
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// 创建Webhook通知器
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ResultNotifier for WebhookNotifier {
    async fn notify_result_ready(&self, order_id: Uuid, triggered_by: Uuid) -> Result<()> {
        let payload = json!({
            "event": "lab.result_ready",
            "order_id": order_id,
            "triggered_by": triggered_by,
            "at": chrono::Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LisError::Internal(format!("notification delivery failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(
                "notification endpoint returned {} for order {}",
                response.status(),
                order_id
            );
            return Err(LisError::Internal(format!(
                "notification endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
