//! 危急值处理流程
//!
//! 确保危急结果能够及时生成警报并跟踪确认情况。
//! 警报与触发结果同步创建, 不允许延后到触发事务之外。

use std::sync::Arc;

use chrono::Utc;
use lis_core::{AlertFilter, AlertStatus, CriticalValueAlert, Result};
use lis_store::{AlertStore, ResultRecorded};
use uuid::Uuid;

/// 危急值引擎
pub struct CriticalValueEngine {
    alerts: Arc<dyn AlertStore>,
}

impl CriticalValueEngine {
    /// 创建危急值引擎
    pub fn new(alerts: Arc<dyn AlertStore>) -> Self {
        Self { alerts }
    }

    /// 对刚写入的结果检查危急分类, 命中则生成一条警报
    ///
    /// 每条触发结果恰好一条警报; 非危急分类返回None。
    pub async fn raise_if_critical(
        &self,
        recorded: &ResultRecorded,
    ) -> Result<Option<CriticalValueAlert>> {
        let flag = match recorded.item.flag {
            Some(flag) if flag.is_critical() => flag,
            _ => return Ok(None),
        };

        let alert = CriticalValueAlert {
            id: Uuid::new_v4(),
            item_id: recorded.item.id,
            order_id: recorded.order_id,
            patient_id: recorded.patient_id,
            test_code: recorded.item.test_code.clone(),
            test_name: recorded.item.test_name.clone(),
            value: recorded.item.result_value.clone().unwrap_or_default(),
            numeric_value: recorded.item.numeric_result,
            flag,
            alerted_at: Utc::now(),
            status: AlertStatus::New,
            acknowledged_at: None,
            acknowledged_by: None,
        };

        let alert = self.alerts.create_alert(alert).await?;
        tracing::warn!(
            "critical value alert {} raised: {} = {} ({:?}) for patient {}",
            alert.id,
            alert.test_code,
            alert.value,
            alert.flag,
            alert.patient_id
        );
        Ok(Some(alert))
    }

    /// 确认警报; 重复确认是无操作
    pub async fn acknowledge(&self, alert_id: Uuid, actor: Uuid) -> Result<CriticalValueAlert> {
        let alert = self.alerts.acknowledge(alert_id, actor).await?;
        tracing::info!("critical value alert {} acknowledged by {}", alert_id, actor);
        Ok(alert)
    }

    /// 按确认状态与时间范围查询警报
    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<CriticalValueAlert>> {
        self.alerts.list_alerts(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::{ItemStatus, LabOrderItem, OrderStatus, ReferenceBounds, ResultFlag};
    use lis_store::MemoryStore;

    fn recorded_with_flag(flag: Option<ResultFlag>) -> ResultRecorded {
        ResultRecorded {
            order_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            order_status: OrderStatus::Processing,
            item: LabOrderItem {
                id: Uuid::new_v4(),
                order_id: Uuid::new_v4(),
                test_code: "K".to_string(),
                test_name: "Potassium".to_string(),
                unit: Some("mmol/L".to_string()),
                reference_range_text: None,
                bounds: ReferenceBounds::default(),
                result_value: Some("7.2".to_string()),
                numeric_result: Some(7.2),
                flag,
                status: ItemStatus::HasResult,
                resulted_at: Some(Utc::now()),
                audit_notes: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_critical_flag_raises_exactly_one_alert() {
        let store = Arc::new(MemoryStore::new());
        let engine = CriticalValueEngine::new(store.clone());

        let alert = engine
            .raise_if_critical(&recorded_with_flag(Some(ResultFlag::CriticalHigh)))
            .await
            .unwrap();
        assert!(alert.is_some());

        let listed = engine.list(&AlertFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].flag, ResultFlag::CriticalHigh);
        assert_eq!(listed[0].status, AlertStatus::New);
    }

    #[tokio::test]
    async fn test_non_critical_flags_do_not_alert() {
        let store = Arc::new(MemoryStore::new());
        let engine = CriticalValueEngine::new(store.clone());

        for flag in [None, Some(ResultFlag::Normal), Some(ResultFlag::High)] {
            let alert = engine
                .raise_if_critical(&recorded_with_flag(flag))
                .await
                .unwrap();
            assert!(alert.is_none());
        }
        assert!(engine.list(&AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_twice_equals_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = CriticalValueEngine::new(store.clone());

        let alert = engine
            .raise_if_critical(&recorded_with_flag(Some(ResultFlag::CriticalLow)))
            .await
            .unwrap()
            .unwrap();

        let actor = Uuid::new_v4();
        let once = engine.acknowledge(alert.id, actor).await.unwrap();
        let twice = engine.acknowledge(alert.id, Uuid::new_v4()).await.unwrap();

        assert_eq!(once.status, AlertStatus::Acknowledged);
        assert_eq!(twice.acknowledged_by, Some(actor));
        assert_eq!(twice.acknowledged_at, once.acknowledged_at);
    }

    #[tokio::test]
    async fn test_list_filters_by_acknowledgement() {
        let store = Arc::new(MemoryStore::new());
        let engine = CriticalValueEngine::new(store.clone());

        let first = engine
            .raise_if_critical(&recorded_with_flag(Some(ResultFlag::CriticalHigh)))
            .await
            .unwrap()
            .unwrap();
        engine
            .raise_if_critical(&recorded_with_flag(Some(ResultFlag::CriticalLow)))
            .await
            .unwrap();

        engine.acknowledge(first.id, Uuid::new_v4()).await.unwrap();

        let unacked = engine
            .list(&AlertFilter {
                acknowledged: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].flag, ResultFlag::CriticalLow);
    }
}
