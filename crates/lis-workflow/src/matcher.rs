//! 结果匹配器
//!
//! 把解码后的观测记录与待检医嘱项目对账:
//! 按 (样本条码, 项目代码) 定位项目 → 数值解析与分类 → 写结果并
//! 重算医嘱汇总 → 同步触发危急值警报 → 差值核查提示。
//! 匹配不上的观测落为待映射的原始结果, 这不是错误。

use std::sync::Arc;

use chrono::Utc;
use lis_core::{
    utils::parse_numeric_result, BoundaryPolicy, CriticalValueAlert, LabOrderItem, OrderStatus,
    RawResult, RawResultStatus, Result, TestMapping,
};
use lis_protocol::{Hl7Parser, Observation};
use lis_store::{AnalyzerStore, OrderStore, RawResultStore, ResultUpdate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::critical_value::CriticalValueEngine;
use crate::delta_check::{DeltaCheckEngine, DeltaCheckOutcome};

/// 一帧报文的处理结果
///
/// 单条观测失败只计入errors, 不中断整帧。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub processed: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub errors: Vec<String>,
    pub results: Vec<ProcessedResult>,
}

/// 单条观测的处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub analyzer_test_code: String, // 仪器侧代码
    pub test_code: String,          // 映射后的标准代码
    pub outcome: MatchOutcome,
}

/// 匹配结局
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(Box<MatchedResult>),
    Unmatched { raw_result_id: Uuid },
}

/// 匹配成功后的明细
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedResult {
    pub order_id: Uuid,
    pub order_status: OrderStatus,
    pub item: LabOrderItem,
    pub alert: Option<CriticalValueAlert>,
    pub delta: Option<DeltaCheckOutcome>,
}

/// 结果匹配器
pub struct ResultMatcher {
    orders: Arc<dyn OrderStore>,
    raw_results: Arc<dyn RawResultStore>,
    analyzers: Arc<dyn AnalyzerStore>,
    critical: Arc<CriticalValueEngine>,
    delta: Arc<DeltaCheckEngine>,
    parser: Hl7Parser,
    boundary_policy: BoundaryPolicy,
}

impl ResultMatcher {
    /// 创建结果匹配器
    pub fn new(
        orders: Arc<dyn OrderStore>,
        raw_results: Arc<dyn RawResultStore>,
        analyzers: Arc<dyn AnalyzerStore>,
        critical: Arc<CriticalValueEngine>,
        delta: Arc<DeltaCheckEngine>,
        boundary_policy: BoundaryPolicy,
    ) -> Self {
        Self {
            orders,
            raw_results,
            analyzers,
            critical,
            delta,
            parser: Hl7Parser::new(),
            boundary_policy,
        }
    }

    /// 处理一帧仪器报文
    pub async fn process_frame(&self, analyzer_id: Uuid, raw_frame: &str) -> Result<ProcessOutcome> {
        let message = match self.parser.parse(raw_frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("analyzer {} sent undecodable frame: {}", analyzer_id, e);
                return Ok(ProcessOutcome {
                    errors: vec![e.to_string()],
                    ..Default::default()
                });
            }
        };

        if message.message_type != "ORU" {
            debug!(
                "analyzer {} sent non-result message {}, ignored",
                analyzer_id, message.message_type
            );
            return Ok(ProcessOutcome::default());
        }

        let (observations, decode_errors) = self.parser.parse_observations(&message);

        let mut outcome = ProcessOutcome {
            processed: observations.len(),
            errors: decode_errors,
            ..Default::default()
        };

        let mappings = match self.analyzers.mappings_for(analyzer_id).await {
            Ok(mappings) => mappings,
            Err(e) => {
                outcome.errors.push(format!("failed to load test mappings: {}", e));
                Vec::new()
            }
        };

        for observation in &observations {
            match self
                .process_observation(analyzer_id, observation, &mappings, raw_frame)
                .await
            {
                Ok(result) => {
                    match result.outcome {
                        MatchOutcome::Matched(_) => outcome.matched += 1,
                        MatchOutcome::Unmatched { .. } => outcome.unmatched += 1,
                    }
                    outcome.results.push(result);
                }
                Err(e) => {
                    warn!(
                        "failed to process observation {} from analyzer {}: {}",
                        observation.test_code, analyzer_id, e
                    );
                    outcome
                        .errors
                        .push(format!("{}: {}", observation.test_code, e));
                }
            }
        }

        info!(
            "analyzer {}: processed {} observations, {} matched, {} unmatched, {} errors",
            analyzer_id,
            outcome.processed,
            outcome.matched,
            outcome.unmatched,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    /// 处理单条观测
    async fn process_observation(
        &self,
        analyzer_id: Uuid,
        observation: &Observation,
        mappings: &[TestMapping],
        raw_frame: &str,
    ) -> Result<ProcessedResult> {
        // 仪器通道代码翻译为院内标准代码
        let mapping = mappings
            .iter()
            .find(|m| m.is_active && m.analyzer_test_code == observation.test_code);
        let test_code = mapping
            .map(|m| m.his_test_code.clone())
            .unwrap_or_else(|| observation.test_code.clone());
        let factor = mapping.and_then(|m| m.conversion_factor);

        let pending = match &observation.sample_id {
            Some(sample_id) => self.orders.find_pending_item(sample_id, &test_code).await?,
            None => None,
        };

        let pending = match pending {
            Some(pending) => pending,
            None => {
                // 匹配不上不是错误: 留存为待映射原始结果
                let raw = self.build_raw(
                    analyzer_id,
                    observation,
                    raw_frame,
                    RawResultStatus::Pending,
                    None,
                );
                let raw_id = raw.id;
                self.raw_results.save_raw(raw).await?;
                debug!(
                    "no matching order item for sample {:?} test {}, stored as unmatched",
                    observation.sample_id, test_code
                );
                return Ok(ProcessedResult {
                    analyzer_test_code: observation.test_code.clone(),
                    test_code,
                    outcome: MatchOutcome::Unmatched { raw_result_id: raw_id },
                });
            }
        };

        // 数值解析(带换算系数)与分类; 非数值结果存原文且不分类
        let numeric =
            parse_numeric_result(&observation.value).map(|v| factor.map_or(v, |f| v * f));
        let flag = numeric.map(|v| pending.bounds.classify(v, self.boundary_policy));
        let stored_value = match (numeric, factor) {
            (Some(v), Some(_)) => v.to_string(),
            _ => observation.value.clone(),
        };

        let recorded = self
            .orders
            .record_result(
                pending.item_id,
                ResultUpdate {
                    value: stored_value,
                    numeric,
                    flag,
                    unit: observation.unit.clone(),
                    reference_range_text: observation.reference_range.clone(),
                    resulted_at: observation.observed_at.unwrap_or_else(Utc::now),
                },
            )
            .await?;

        let raw = self.build_raw(
            analyzer_id,
            observation,
            raw_frame,
            RawResultStatus::Matched,
            Some(pending.item_id),
        );
        self.raw_results.save_raw(raw).await?;

        // 危急值警报与分类同一处理步骤内产生
        let alert = self.critical.raise_if_critical(&recorded).await?;

        let delta = match numeric {
            Some(value) => {
                self.delta
                    .check(
                        recorded.patient_id,
                        &recorded.item.test_code,
                        value,
                        recorded.order_id,
                    )
                    .await?
            }
            None => None,
        };

        Ok(ProcessedResult {
            analyzer_test_code: observation.test_code.clone(),
            test_code,
            outcome: MatchOutcome::Matched(Box::new(MatchedResult {
                order_id: recorded.order_id,
                order_status: recorded.order_status,
                item: recorded.item,
                alert,
                delta,
            })),
        })
    }

    /// 手工录入结果, 走与仪器结果相同的分类/汇总/警报路径
    pub async fn enter_result(&self, item_id: Uuid, value: &str) -> Result<MatchedResult> {
        let item_ref = self.orders.find_item(item_id).await?;

        let numeric = parse_numeric_result(value);
        let flag = numeric.map(|v| item_ref.bounds.classify(v, self.boundary_policy));

        let recorded = self
            .orders
            .record_result(
                item_id,
                ResultUpdate {
                    value: value.to_string(),
                    numeric,
                    flag,
                    unit: None,
                    reference_range_text: None,
                    resulted_at: Utc::now(),
                },
            )
            .await?;

        let alert = self.critical.raise_if_critical(&recorded).await?;
        let delta = match numeric {
            Some(v) => {
                self.delta
                    .check(
                        recorded.patient_id,
                        &recorded.item.test_code,
                        v,
                        recorded.order_id,
                    )
                    .await?
            }
            None => None,
        };

        Ok(MatchedResult {
            order_id: recorded.order_id,
            order_status: recorded.order_status,
            item: recorded.item,
            alert,
            delta,
        })
    }

    /// 把一条未匹配的原始结果人工映射到指定项目
    pub async fn map_raw_result(
        &self,
        raw_result_id: Uuid,
        item_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<MatchedResult> {
        let raw = self.raw_results.get_raw(raw_result_id).await?;
        let value = raw.value.clone().unwrap_or_default();

        let matched = self.enter_result(item_id, &value).await?;
        self.raw_results
            .mark_mapped(raw_result_id, item_id, actor)
            .await?;

        info!(
            "raw result {} manually mapped to item {}",
            raw_result_id, item_id
        );
        Ok(matched)
    }

    fn build_raw(
        &self,
        analyzer_id: Uuid,
        observation: &Observation,
        raw_frame: &str,
        status: RawResultStatus,
        matched_item_id: Option<Uuid>,
    ) -> RawResult {
        RawResult {
            id: Uuid::new_v4(),
            analyzer_id,
            sample_id: observation.sample_id.clone(),
            patient_id: observation.patient_id.clone(),
            test_code: Some(observation.test_code.clone()),
            value: Some(observation.value.clone()),
            unit: observation.unit.clone(),
            flag: observation.abnormal_flag.clone(),
            observed_at: observation.observed_at,
            raw_message: raw_frame.to_string(),
            status,
            matched_item_id,
            mapped_at: matched_item_id.map(|_| Utc::now()),
            mapped_by: None,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta_check::DEFAULT_DELTA_THRESHOLD_PERCENT;
    use lis_core::{ItemStatus, ReferenceBounds};
    use lis_store::{AlertStore, MemoryStore, NewOrder, NewOrderItem, NewTestMapping};

    fn matcher_over(store: &Arc<MemoryStore>) -> ResultMatcher {
        let critical = Arc::new(CriticalValueEngine::new(store.clone()));
        let delta = Arc::new(DeltaCheckEngine::new(
            store.clone(),
            DEFAULT_DELTA_THRESHOLD_PERCENT,
        ));
        ResultMatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            critical,
            delta,
            BoundaryPolicy::Strict,
        )
    }

    fn panel_order(barcode: &str) -> NewOrder {
        NewOrder {
            patient_id: Uuid::new_v4(),
            sample_barcode: Some(barcode.to_string()),
            sample_type: Some("Serum".to_string()),
            items: vec![
                NewOrderItem {
                    test_code: "GLU".to_string(),
                    test_name: "Glucose".to_string(),
                    unit: Some("mmol/L".to_string()),
                    reference_range_text: None,
                    bounds: ReferenceBounds {
                        normal_min: Some(3.5),
                        normal_max: Some(5.5),
                        critical_low: Some(2.0),
                        critical_high: Some(7.0),
                    },
                },
                NewOrderItem {
                    test_code: "K".to_string(),
                    test_name: "Potassium".to_string(),
                    unit: Some("mmol/L".to_string()),
                    reference_range_text: None,
                    bounds: ReferenceBounds {
                        normal_min: Some(3.5),
                        normal_max: Some(5.5),
                        critical_low: Some(2.5),
                        critical_high: Some(6.5),
                    },
                },
            ],
        }
    }

    fn oru_frame(barcode: &str, results: &[(&str, &str)]) -> String {
        let mut frame = String::from(
            "MSH|^~\\&|ANALYZER|LAB|LIS|HOSPITAL|20260115083000||ORU^R01|MSG001|P|2.5\r",
        );
        frame.push_str("PID|1||P000123^^^MRN||TEST^PATIENT\r");
        frame.push_str(&format!("OBR|1|O1|{}|PANEL^Basic Panel\r", barcode));
        for (index, (code, value)) in results.iter().enumerate() {
            frame.push_str(&format!(
                "OBX|{}|NM|{}^{}||{}|mmol/L|3.5-5.5|N|||F|||20260115082500\r",
                index + 1,
                code,
                code,
                value
            ));
        }
        frame
    }

    #[tokio::test]
    async fn test_matched_results_advance_order() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);
        let order = store.create_order(panel_order("BC001")).await.unwrap();

        let outcome = matcher
            .process_frame(
                Uuid::new_v4(),
                &oru_frame("BC001", &[("GLU", "4.5"), ("K", "4.0")]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.unmatched, 0);
        assert!(outcome.errors.is_empty());

        let reloaded = store.get_order(order.id).await.unwrap();
        assert_eq!(reloaded.status, OrderStatus::PendingApproval);
        assert!(reloaded
            .items
            .iter()
            .all(|i| i.status == ItemStatus::HasResult));
        assert_eq!(reloaded.items[0].flag, Some(lis_core::ResultFlag::Normal));
    }

    #[tokio::test]
    async fn test_critical_result_raises_alert_synchronously() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);
        store.create_order(panel_order("BC001")).await.unwrap();

        let outcome = matcher
            .process_frame(Uuid::new_v4(), &oru_frame("BC001", &[("K", "6.8")]))
            .await
            .unwrap();

        assert_eq!(outcome.matched, 1);
        match &outcome.results[0].outcome {
            MatchOutcome::Matched(matched) => {
                assert_eq!(matched.item.flag, Some(lis_core::ResultFlag::CriticalHigh));
                assert!(matched.alert.is_some());
            }
            other => panic!("expected matched, got {:?}", other),
        }

        let alerts = store.list_alerts(&lis_core::AlertFilter::default()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].test_code, "K");
    }

    #[tokio::test]
    async fn test_unmatched_observation_is_stored_not_errored() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);

        // 条码XYZ999没有任何待检医嘱
        let analyzer_id = Uuid::new_v4();
        let outcome = matcher
            .process_frame(analyzer_id, &oru_frame("XYZ999", &[("GLU", "5.0")]))
            .await
            .unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.matched, 0);
        assert_eq!(outcome.unmatched, 1);
        assert!(outcome.errors.is_empty());

        let unmatched = store.list_unmatched(Some(analyzer_id)).await.unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].sample_id.as_deref(), Some("XYZ999"));
        assert_eq!(unmatched[0].status, RawResultStatus::Pending);

        // 未匹配不产生警报
        assert!(store.list_alerts(&lis_core::AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mapping_translates_code_and_applies_factor() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);
        let analyzer_id = Uuid::new_v4();

        store
            .set_mappings(
                analyzer_id,
                vec![NewTestMapping {
                    analyzer_test_code: "GLU-A".to_string(),
                    analyzer_test_name: Some("Glucose (channel A)".to_string()),
                    his_test_code: "GLU".to_string(),
                    his_test_name: "Glucose".to_string(),
                    conversion_factor: Some(0.1),
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        let order = store.create_order(panel_order("BC001")).await.unwrap();

        let outcome = matcher
            .process_frame(analyzer_id, &oru_frame("BC001", &[("GLU-A", "45")]))
            .await
            .unwrap();

        assert_eq!(outcome.matched, 1);
        let reloaded = store.get_order(order.id).await.unwrap();
        let item = reloaded.items.iter().find(|i| i.test_code == "GLU").unwrap();
        // 45 * 0.1 = 4.5, 正常范围内
        assert_eq!(item.numeric_result, Some(4.5));
        assert_eq!(item.flag, Some(lis_core::ResultFlag::Normal));
    }

    #[tokio::test]
    async fn test_non_numeric_value_gets_neutral_flag() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);
        let order = store.create_order(panel_order("BC001")).await.unwrap();

        let outcome = matcher
            .process_frame(Uuid::new_v4(), &oru_frame("BC001", &[("GLU", "POSITIVE")]))
            .await
            .unwrap();

        assert_eq!(outcome.matched, 1);
        let reloaded = store.get_order(order.id).await.unwrap();
        let item = reloaded.items.iter().find(|i| i.test_code == "GLU").unwrap();
        assert_eq!(item.result_value.as_deref(), Some("POSITIVE"));
        assert!(item.numeric_result.is_none());
        assert!(item.flag.is_none());
        assert_eq!(item.status, ItemStatus::HasResult);

        // 非数值结果不可能触发警报
        assert!(store.list_alerts(&lis_core::AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_reports_error_without_failing() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);

        let outcome = matcher
            .process_frame(Uuid::new_v4(), "garbage that is not HL7")
            .await
            .unwrap();

        assert_eq!(outcome.processed, 0);
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_results_for_same_order_settle_consistently() {
        let store = Arc::new(MemoryStore::new());
        let order = store.create_order(panel_order("BC001")).await.unwrap();

        // 两条结果几乎同时到达: 汇总状态不允许两边都读到过期计数
        let matcher_a = Arc::new(matcher_over(&store));
        let matcher_b = matcher_a.clone();

        let frame_a = oru_frame("BC001", &[("GLU", "4.5")]);
        let frame_b = oru_frame("BC001", &[("K", "4.0")]);
        let analyzer = Uuid::new_v4();

        let (a, b) = tokio::join!(
            tokio::spawn(async move { matcher_a.process_frame(analyzer, &frame_a).await }),
            tokio::spawn(async move { matcher_b.process_frame(analyzer, &frame_b).await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        let reloaded = store.get_order(order.id).await.unwrap();
        assert_eq!(reloaded.status, OrderStatus::PendingApproval);
        assert!(reloaded.processing_ended_at.is_some());
    }

    #[tokio::test]
    async fn test_manual_mapping_applies_raw_value() {
        let store = Arc::new(MemoryStore::new());
        let matcher = matcher_over(&store);
        let analyzer_id = Uuid::new_v4();

        // 先产生一条未匹配结果
        matcher
            .process_frame(analyzer_id, &oru_frame("XYZ999", &[("GLU", "4.2")]))
            .await
            .unwrap();
        let raw = store.list_unmatched(None).await.unwrap().remove(0);

        // 建立医嘱后人工映射
        let order = store.create_order(panel_order("BC001")).await.unwrap();
        let item_id = order.items[0].id;
        let matched = matcher
            .map_raw_result(raw.id, item_id, Some(Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(matched.item.numeric_result, Some(4.2));
        assert!(store.list_unmatched(None).await.unwrap().is_empty());
        let mapped = store.get_raw(raw.id).await.unwrap();
        assert_eq!(mapped.status, RawResultStatus::ManuallyMapped);
        assert_eq!(mapped.matched_item_id, Some(item_id));
    }
}
