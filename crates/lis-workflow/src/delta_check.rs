//! 差值核查 (Delta Check)
//!
//! 新结果与患者本人同项目最近一次既往结果比较, 捕捉不合生理的跳变。
//! 仅作提示, 不改变项目状态。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lis_core::Result;
use lis_store::OrderStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 默认危急差值阈值 (%)
pub const DEFAULT_DELTA_THRESHOLD_PERCENT: f64 = 50.0;

/// 单项差值核查结论
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaCheckOutcome {
    pub test_code: String,
    pub current_value: f64,
    pub previous_value: f64,
    pub previous_at: DateTime<Utc>,
    pub delta_percent: f64,
    pub threshold_percent: f64,
    pub is_critical: bool,
}

/// 整单差值核查报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaCheckReport {
    pub order_id: Uuid,
    pub items: Vec<DeltaCheckOutcome>,
    pub has_critical_delta: bool,
}

/// 差值核查引擎
pub struct DeltaCheckEngine {
    orders: Arc<dyn OrderStore>,
    threshold_percent: f64,
}

impl DeltaCheckEngine {
    /// 创建引擎, 阈值可配置
    pub fn new(orders: Arc<dyn OrderStore>, threshold_percent: f64) -> Self {
        Self {
            orders,
            threshold_percent,
        }
    }

    /// 对单个新数值结果做差值核查
    ///
    /// 既往值为0或不存在时跳过 (差值百分比无定义)。
    pub async fn check(
        &self,
        patient_id: Uuid,
        test_code: &str,
        current_value: f64,
        exclude_order: Uuid,
    ) -> Result<Option<DeltaCheckOutcome>> {
        let prior = match self
            .orders
            .prior_numeric_result(patient_id, test_code, exclude_order)
            .await?
        {
            Some(prior) => prior,
            None => return Ok(None),
        };

        if prior.value == 0.0 {
            return Ok(None);
        }

        let delta_percent = ((current_value - prior.value).abs() / prior.value) * 100.0;
        let is_critical = delta_percent > self.threshold_percent;

        if is_critical {
            tracing::warn!(
                "critical delta for patient {} test {}: {} -> {} ({:.1}% > {:.1}%)",
                patient_id,
                test_code,
                prior.value,
                current_value,
                delta_percent,
                self.threshold_percent
            );
        }

        Ok(Some(DeltaCheckOutcome {
            test_code: test_code.to_string(),
            current_value,
            previous_value: prior.value,
            previous_at: prior.resulted_at,
            delta_percent,
            threshold_percent: self.threshold_percent,
            is_critical,
        }))
    }

    /// 对医嘱的全部数值结果做差值核查
    pub async fn check_order(&self, order_id: Uuid) -> Result<DeltaCheckReport> {
        let order = self.orders.get_order(order_id).await?;
        let mut items = Vec::new();

        for item in &order.items {
            if let Some(value) = item.numeric_result {
                if let Some(outcome) = self
                    .check(order.patient_id, &item.test_code, value, order_id)
                    .await?
                {
                    items.push(outcome);
                }
            }
        }

        let has_critical_delta = items.iter().any(|i| i.is_critical);
        Ok(DeltaCheckReport {
            order_id,
            items,
            has_critical_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::ReferenceBounds;
    use lis_store::{MemoryStore, NewOrder, NewOrderItem, ResultUpdate};

    fn glucose_order(patient_id: Uuid, barcode: &str) -> NewOrder {
        NewOrder {
            patient_id,
            sample_barcode: Some(barcode.to_string()),
            sample_type: None,
            items: vec![NewOrderItem {
                test_code: "GLU".to_string(),
                test_name: "Glucose".to_string(),
                unit: Some("mg/dL".to_string()),
                reference_range_text: None,
                bounds: ReferenceBounds::default(),
            }],
        }
    }

    async fn enter(store: &MemoryStore, item_id: Uuid, value: f64) {
        store
            .record_result(
                item_id,
                ResultUpdate {
                    value: value.to_string(),
                    numeric: Some(value),
                    flag: None,
                    unit: None,
                    reference_range_text: None,
                    resulted_at: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delta_exceeding_threshold_is_critical() {
        let store = Arc::new(MemoryStore::new());
        let patient_id = Uuid::new_v4();

        let earlier = store
            .create_order(glucose_order(patient_id, "BC001"))
            .await
            .unwrap();
        enter(&store, earlier.items[0].id, 90.0).await;

        let current = store
            .create_order(glucose_order(patient_id, "BC002"))
            .await
            .unwrap();

        let engine =
            DeltaCheckEngine::new(store.clone(), DEFAULT_DELTA_THRESHOLD_PERCENT);
        let outcome = engine
            .check(patient_id, "GLU", 200.0, current.id)
            .await
            .unwrap()
            .unwrap();

        // |200-90|/90*100 ≈ 122.2%
        assert!((outcome.delta_percent - 122.2).abs() < 0.1);
        assert!(outcome.is_critical);
        assert_eq!(outcome.previous_value, 90.0);
    }

    #[tokio::test]
    async fn test_small_delta_is_not_critical() {
        let store = Arc::new(MemoryStore::new());
        let patient_id = Uuid::new_v4();

        let earlier = store
            .create_order(glucose_order(patient_id, "BC001"))
            .await
            .unwrap();
        enter(&store, earlier.items[0].id, 100.0).await;

        let current = store
            .create_order(glucose_order(patient_id, "BC002"))
            .await
            .unwrap();

        let engine =
            DeltaCheckEngine::new(store.clone(), DEFAULT_DELTA_THRESHOLD_PERCENT);
        let outcome = engine
            .check(patient_id, "GLU", 120.0, current.id)
            .await
            .unwrap()
            .unwrap();

        assert!((outcome.delta_percent - 20.0).abs() < 1e-9);
        assert!(!outcome.is_critical);
    }

    #[tokio::test]
    async fn test_zero_previous_value_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let patient_id = Uuid::new_v4();

        let earlier = store
            .create_order(glucose_order(patient_id, "BC001"))
            .await
            .unwrap();
        enter(&store, earlier.items[0].id, 0.0).await;

        let current = store
            .create_order(glucose_order(patient_id, "BC002"))
            .await
            .unwrap();

        let engine =
            DeltaCheckEngine::new(store.clone(), DEFAULT_DELTA_THRESHOLD_PERCENT);
        assert!(engine
            .check(patient_id, "GLU", 5.0, current.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_prior_result_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let patient_id = Uuid::new_v4();
        let current = store
            .create_order(glucose_order(patient_id, "BC001"))
            .await
            .unwrap();

        let engine =
            DeltaCheckEngine::new(store.clone(), DEFAULT_DELTA_THRESHOLD_PERCENT);
        assert!(engine
            .check(patient_id, "GLU", 5.0, current.id)
            .await
            .unwrap()
            .is_none());
    }
}
