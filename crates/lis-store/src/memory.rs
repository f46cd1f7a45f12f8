//! 内存仓储实现
//!
//! 测试与单机部署用。医嘱表由单把互斥锁保护, "写结果 + 重算汇总"
//! 天然处于同一临界区内, 满足单医嘱串行化要求。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lis_core::{
    AlertFilter, AlertStatus, Analyzer, ConnectionLogEntry, CriticalValueAlert, ItemStatus,
    LabOrder, LabOrderItem, LisError, OrderStatus, QcLevel, QcLot, QcRun, RawResult,
    RawResultStatus, Result, TestMapping, WorklistEntry, WorklistStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::{
    AlertStore, AnalyzerSpec, AnalyzerStore, FinalApprovalOutcome, NewOrder, NewTestMapping,
    OrderStore, PendingItemRef, PriorResult, QcStore, RawResultStore, ResultRecorded,
    ResultUpdate, WorklistStore,
};

/// 内存仓储
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, LabOrder>>,
    raw_results: Mutex<HashMap<Uuid, RawResult>>,
    alerts: Mutex<HashMap<Uuid, CriticalValueAlert>>,
    qc_lots: Mutex<HashMap<Uuid, QcLot>>,
    qc_runs: Mutex<Vec<QcRun>>,
    analyzers: Mutex<HashMap<Uuid, Analyzer>>,
    mappings: Mutex<HashMap<Uuid, Vec<TestMapping>>>,
    connection_logs: Mutex<Vec<ConnectionLogEntry>>,
    worklists: Mutex<HashMap<Uuid, WorklistEntry>>,
    order_seq: AtomicU64,
}

impl MemoryStore {
    /// 创建空仓储
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            raw_results: Mutex::new(HashMap::new()),
            alerts: Mutex::new(HashMap::new()),
            qc_lots: Mutex::new(HashMap::new()),
            qc_runs: Mutex::new(Vec::new()),
            analyzers: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
            connection_logs: Mutex::new(Vec::new()),
            worklists: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create_order(&self, order: NewOrder) -> Result<LabOrder> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);

        let items = order
            .items
            .into_iter()
            .map(|item| LabOrderItem {
                id: Uuid::new_v4(),
                order_id,
                test_code: item.test_code,
                test_name: item.test_name,
                unit: item.unit,
                reference_range_text: item.reference_range_text,
                bounds: item.bounds,
                result_value: None,
                numeric_result: None,
                flag: None,
                status: ItemStatus::Pending,
                resulted_at: None,
                audit_notes: Vec::new(),
            })
            .collect();

        let record = LabOrder {
            id: order_id,
            order_code: format!("LAB{:06}", seq),
            patient_id: order.patient_id,
            sample_barcode: order.sample_barcode,
            sample_type: order.sample_type,
            status: OrderStatus::Pending,
            ordered_at: now,
            collected_at: None,
            processing_started_at: None,
            processing_ended_at: None,
            approved_at: None,
            approved_by: None,
            technician_note: None,
            doctor_note: None,
            audit_notes: Vec::new(),
            items,
        };

        self.orders.lock().await.insert(order_id, record.clone());
        Ok(record)
    }

    async fn get_order(&self, order_id: Uuid) -> Result<LabOrder> {
        self.orders
            .lock()
            .await
            .get(&order_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))
    }

    async fn find_pending_item(
        &self,
        barcode: &str,
        test_code: &str,
    ) -> Result<Option<PendingItemRef>> {
        let orders = self.orders.lock().await;
        for order in orders.values() {
            if order.status == OrderStatus::Cancelled {
                continue;
            }
            if order.sample_barcode.as_deref() != Some(barcode) {
                continue;
            }
            if let Some(item) = order
                .items
                .iter()
                .find(|i| i.test_code == test_code && i.status != ItemStatus::Approved)
            {
                return Ok(Some(PendingItemRef {
                    order_id: order.id,
                    item_id: item.id,
                    patient_id: order.patient_id,
                    test_code: item.test_code.clone(),
                    test_name: item.test_name.clone(),
                    bounds: item.bounds,
                    status: item.status,
                }));
            }
        }
        Ok(None)
    }

    async fn find_item(&self, item_id: Uuid) -> Result<PendingItemRef> {
        let orders = self.orders.lock().await;
        for order in orders.values() {
            if let Some(item) = order.items.iter().find(|i| i.id == item_id) {
                return Ok(PendingItemRef {
                    order_id: order.id,
                    item_id: item.id,
                    patient_id: order.patient_id,
                    test_code: item.test_code.clone(),
                    test_name: item.test_name.clone(),
                    bounds: item.bounds,
                    status: item.status,
                });
            }
        }
        Err(LisError::NotFound(format!("order item {} not found", item_id)))
    }

    async fn record_result(&self, item_id: Uuid, update: ResultUpdate) -> Result<ResultRecorded> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .values_mut()
            .find(|o| o.items.iter().any(|i| i.id == item_id))
            .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;

        if order.status == OrderStatus::Cancelled {
            return Err(LisError::InvalidStateTransition {
                from: "Cancelled".to_string(),
                action: "record_result".to_string(),
            });
        }

        let order_id = order.id;
        let patient_id = order.patient_id;

        {
            let item = order
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;

            if item.status == ItemStatus::Approved {
                return Err(LisError::Validation(format!(
                    "item {} is already approved and cannot receive results",
                    item_id
                )));
            }

            item.result_value = Some(update.value);
            item.numeric_result = update.numeric;
            item.flag = update.flag;
            item.resulted_at = Some(update.resulted_at);
            item.status = ItemStatus::HasResult;
            if let Some(unit) = update.unit {
                item.unit = Some(unit);
            }
            if let Some(text) = update.reference_range_text {
                item.reference_range_text = Some(text);
            }
        }

        // 同一临界区内重算汇总状态, 避免并发结果同时读到过期计数
        order.recompute_status(Utc::now());

        let item = order
            .items
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
            .ok_or_else(|| LisError::Internal("item vanished during update".to_string()))?;

        Ok(ResultRecorded {
            order_id,
            patient_id,
            order_status: order.status,
            item,
        })
    }

    async fn preliminary_approve(&self, order_id: Uuid, note: &str) -> Result<LabOrder> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        match order.status {
            OrderStatus::PendingApproval | OrderStatus::PreliminaryApproved => {}
            other => {
                return Err(LisError::InvalidStateTransition {
                    from: format!("{:?}", other),
                    action: "preliminary_approve".to_string(),
                })
            }
        }

        order.technician_note = Some(note.to_string());
        order.status = OrderStatus::PreliminaryApproved;
        Ok(order.clone())
    }

    async fn final_approve(
        &self,
        order_id: Uuid,
        note: &str,
        actor: Uuid,
    ) -> Result<FinalApprovalOutcome> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        match order.status {
            OrderStatus::Cancelled | OrderStatus::Approved | OrderStatus::Pending => {
                return Err(LisError::InvalidStateTransition {
                    from: format!("{:?}", order.status),
                    action: "final_approve".to_string(),
                })
            }
            _ => {}
        }

        let mut approved_items = 0;
        let mut missing = Vec::new();
        for item in &mut order.items {
            match item.status {
                ItemStatus::HasResult => {
                    item.status = ItemStatus::Approved;
                    approved_items += 1;
                }
                ItemStatus::Approved => approved_items += 1,
                ItemStatus::Pending => missing.push(item.test_code.clone()),
            }
        }

        let order_approved = missing.is_empty();
        if order_approved {
            order.status = OrderStatus::Approved;
            order.approved_at = Some(Utc::now());
            order.approved_by = Some(actor);
            order.doctor_note = Some(note.to_string());
        }

        Ok(FinalApprovalOutcome {
            approved_items,
            missing,
            order_approved,
        })
    }

    async fn cancel_approval(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        let had_approved = order
            .items
            .iter()
            .any(|i| i.status == ItemStatus::Approved);
        if !had_approved && order.status != OrderStatus::Approved {
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "cancel_approval".to_string(),
            });
        }

        for item in &mut order.items {
            if item.status == ItemStatus::Approved {
                item.status = ItemStatus::HasResult;
            }
        }
        order.status = OrderStatus::PendingApproval;
        order.approved_at = None;
        order.approved_by = None;
        order.audit_notes.push(format!("cancel approval: {}", reason));

        Ok(order.clone())
    }

    async fn rerun_item(&self, item_id: Uuid, reason: &str) -> Result<LabOrder> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .values_mut()
            .find(|o| o.items.iter().any(|i| i.id == item_id))
            .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;

        {
            let item = order
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or_else(|| LisError::Internal("item vanished during rerun".to_string()))?;

            if item.status == ItemStatus::Pending {
                return Err(LisError::Validation(format!(
                    "item {} has no result to rerun",
                    item_id
                )));
            }

            item.result_value = None;
            item.numeric_result = None;
            item.flag = None;
            item.resulted_at = None;
            item.status = ItemStatus::Pending;
            item.audit_notes.push(format!("rerun: {}", reason));
        }

        // 医嘱从待审/已审退回检验中
        if matches!(
            order.status,
            OrderStatus::PendingApproval | OrderStatus::PreliminaryApproved | OrderStatus::Approved
        ) {
            order.status = OrderStatus::Processing;
            order.processing_ended_at = None;
            order.approved_at = None;
            order.approved_by = None;
        }
        order.audit_notes.push(format!("item rerun: {}", reason));

        Ok(order.clone())
    }

    async fn mark_collected(&self, order_id: Uuid, barcode: String) -> Result<LabOrder> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        if order.status != OrderStatus::Pending {
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "mark_collected".to_string(),
            });
        }

        order.sample_barcode = Some(barcode);
        order.collected_at = Some(Utc::now());
        order.status = OrderStatus::Collected;
        Ok(order.clone())
    }

    async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        if matches!(order.status, OrderStatus::Approved | OrderStatus::Cancelled) {
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "cancel_order".to_string(),
            });
        }

        order.status = OrderStatus::Cancelled;
        order.audit_notes.push(format!("cancelled: {}", reason));
        Ok(order.clone())
    }

    async fn prior_numeric_result(
        &self,
        patient_id: Uuid,
        test_code: &str,
        exclude_order: Uuid,
    ) -> Result<Option<PriorResult>> {
        let orders = self.orders.lock().await;
        let mut best: Option<PriorResult> = None;

        for order in orders.values() {
            if order.patient_id != patient_id
                || order.id == exclude_order
                || order.status == OrderStatus::Cancelled
            {
                continue;
            }
            for item in &order.items {
                if item.test_code != test_code {
                    continue;
                }
                if let (Some(value), Some(at)) = (item.numeric_result, item.resulted_at) {
                    if best.as_ref().map(|b| at > b.resulted_at).unwrap_or(true) {
                        best = Some(PriorResult {
                            order_id: order.id,
                            value,
                            resulted_at: at,
                        });
                    }
                }
            }
        }

        Ok(best)
    }
}

#[async_trait]
impl RawResultStore for MemoryStore {
    async fn save_raw(&self, raw: RawResult) -> Result<()> {
        self.raw_results.lock().await.insert(raw.id, raw);
        Ok(())
    }

    async fn get_raw(&self, raw_id: Uuid) -> Result<RawResult> {
        self.raw_results
            .lock()
            .await
            .get(&raw_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("raw result {} not found", raw_id)))
    }

    async fn list_unmatched(&self, analyzer_id: Option<Uuid>) -> Result<Vec<RawResult>> {
        let raw = self.raw_results.lock().await;
        let mut results: Vec<RawResult> = raw
            .values()
            .filter(|r| r.status == RawResultStatus::Pending)
            .filter(|r| analyzer_id.map(|id| r.analyzer_id == id).unwrap_or(true))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(results)
    }

    async fn mark_mapped(
        &self,
        raw_id: Uuid,
        item_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<RawResult> {
        let mut raw = self.raw_results.lock().await;
        let record = raw
            .get_mut(&raw_id)
            .ok_or_else(|| LisError::NotFound(format!("raw result {} not found", raw_id)))?;

        record.status = RawResultStatus::ManuallyMapped;
        record.matched_item_id = Some(item_id);
        record.mapped_at = Some(Utc::now());
        record.mapped_by = actor;
        Ok(record.clone())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: CriticalValueAlert) -> Result<CriticalValueAlert> {
        self.alerts.lock().await.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn get_alert(&self, alert_id: Uuid) -> Result<CriticalValueAlert> {
        self.alerts
            .lock()
            .await
            .get(&alert_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("alert {} not found", alert_id)))
    }

    async fn acknowledge(&self, alert_id: Uuid, actor: Uuid) -> Result<CriticalValueAlert> {
        let mut alerts = self.alerts.lock().await;
        let alert = alerts
            .get_mut(&alert_id)
            .ok_or_else(|| LisError::NotFound(format!("alert {} not found", alert_id)))?;

        // 重复确认是无操作
        if alert.status == AlertStatus::New {
            alert.status = AlertStatus::Acknowledged;
            alert.acknowledged_at = Some(Utc::now());
            alert.acknowledged_by = Some(actor);
        }
        Ok(alert.clone())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<CriticalValueAlert>> {
        let alerts = self.alerts.lock().await;
        let mut results: Vec<CriticalValueAlert> = alerts
            .values()
            .filter(|a| match filter.acknowledged {
                Some(true) => a.status == AlertStatus::Acknowledged,
                Some(false) => a.status == AlertStatus::New,
                None => true,
            })
            .filter(|a| filter.from.map(|f| a.alerted_at >= f).unwrap_or(true))
            .filter(|a| filter.to.map(|t| a.alerted_at <= t).unwrap_or(true))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.alerted_at.cmp(&a.alerted_at));
        Ok(results)
    }
}

#[async_trait]
impl QcStore for MemoryStore {
    async fn upsert_lot(&self, lot: QcLot) -> Result<QcLot> {
        self.qc_lots.lock().await.insert(lot.id, lot.clone());
        Ok(lot)
    }

    async fn get_lot(&self, lot_id: Uuid) -> Result<QcLot> {
        self.qc_lots
            .lock()
            .await
            .get(&lot_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("QC lot {} not found", lot_id)))
    }

    async fn find_lot(
        &self,
        analyzer_id: Uuid,
        test_code: &str,
        level: QcLevel,
    ) -> Result<Option<QcLot>> {
        Ok(self
            .qc_lots
            .lock()
            .await
            .values()
            .find(|l| {
                l.analyzer_id == analyzer_id
                    && l.test_code == test_code
                    && l.level == level
                    && l.is_active
            })
            .cloned())
    }

    async fn save_run(&self, run: QcRun) -> Result<()> {
        self.qc_runs.lock().await.push(run);
        Ok(())
    }

    async fn list_runs(
        &self,
        test_code: &str,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QcRun>> {
        let runs = self.qc_runs.lock().await;
        let mut results: Vec<QcRun> = runs
            .iter()
            .filter(|r| {
                r.test_code == test_code
                    && r.analyzer_id == analyzer_id
                    && r.run_at >= from
                    && r.run_at <= to
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| a.run_at.cmp(&b.run_at));
        Ok(results)
    }
}

#[async_trait]
impl AnalyzerStore for MemoryStore {
    async fn create_analyzer(&self, spec: AnalyzerSpec) -> Result<Analyzer> {
        let now = Utc::now();
        let analyzer = Analyzer {
            id: Uuid::new_v4(),
            code: spec.code,
            name: spec.name,
            manufacturer: spec.manufacturer,
            model: spec.model,
            protocol: spec.protocol,
            connection: spec.connection,
            is_active: spec.is_active,
            last_connected_at: None,
            last_data_received_at: None,
            created_at: now,
            updated_at: now,
        };
        self.analyzers
            .lock()
            .await
            .insert(analyzer.id, analyzer.clone());
        Ok(analyzer)
    }

    async fn update_analyzer(&self, analyzer_id: Uuid, spec: AnalyzerSpec) -> Result<Analyzer> {
        let mut analyzers = self.analyzers.lock().await;
        let analyzer = analyzers
            .get_mut(&analyzer_id)
            .ok_or_else(|| LisError::NotFound(format!("analyzer {} not found", analyzer_id)))?;

        analyzer.code = spec.code;
        analyzer.name = spec.name;
        analyzer.manufacturer = spec.manufacturer;
        analyzer.model = spec.model;
        analyzer.protocol = spec.protocol;
        analyzer.connection = spec.connection;
        analyzer.is_active = spec.is_active;
        analyzer.updated_at = Utc::now();
        Ok(analyzer.clone())
    }

    async fn deactivate_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        let mut analyzers = self.analyzers.lock().await;
        let analyzer = analyzers
            .get_mut(&analyzer_id)
            .ok_or_else(|| LisError::NotFound(format!("analyzer {} not found", analyzer_id)))?;
        analyzer.is_active = false;
        analyzer.updated_at = Utc::now();
        Ok(analyzer.clone())
    }

    async fn get_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        self.analyzers
            .lock()
            .await
            .get(&analyzer_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("analyzer {} not found", analyzer_id)))
    }

    async fn list_analyzers(&self, include_inactive: bool) -> Result<Vec<Analyzer>> {
        let analyzers = self.analyzers.lock().await;
        let mut results: Vec<Analyzer> = analyzers
            .values()
            .filter(|a| include_inactive || a.is_active)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    async fn set_mappings(
        &self,
        analyzer_id: Uuid,
        mappings: Vec<NewTestMapping>,
    ) -> Result<Vec<TestMapping>> {
        let records: Vec<TestMapping> = mappings
            .into_iter()
            .map(|m| TestMapping {
                id: Uuid::new_v4(),
                analyzer_id,
                analyzer_test_code: m.analyzer_test_code,
                analyzer_test_name: m.analyzer_test_name,
                his_test_code: m.his_test_code,
                his_test_name: m.his_test_name,
                conversion_factor: m.conversion_factor,
                is_active: m.is_active,
            })
            .collect();
        self.mappings
            .lock()
            .await
            .insert(analyzer_id, records.clone());
        Ok(records)
    }

    async fn mappings_for(&self, analyzer_id: Uuid) -> Result<Vec<TestMapping>> {
        Ok(self
            .mappings
            .lock()
            .await
            .get(&analyzer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn touch_connected(&self, analyzer_id: Uuid) -> Result<()> {
        if let Some(analyzer) = self.analyzers.lock().await.get_mut(&analyzer_id) {
            analyzer.last_connected_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_data_received(&self, analyzer_id: Uuid) -> Result<()> {
        if let Some(analyzer) = self.analyzers.lock().await.get_mut(&analyzer_id) {
            analyzer.last_data_received_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_connection_log(&self, entry: ConnectionLogEntry) -> Result<()> {
        self.connection_logs.lock().await.push(entry);
        Ok(())
    }

    async fn list_connection_logs(
        &self,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLogEntry>> {
        let logs = self.connection_logs.lock().await;
        let mut results: Vec<ConnectionLogEntry> = logs
            .iter()
            .filter(|l| l.analyzer_id == analyzer_id && l.at >= from && l.at <= to)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(results)
    }
}

#[async_trait]
impl WorklistStore for MemoryStore {
    async fn save_entry(&self, entry: WorklistEntry) -> Result<()> {
        self.worklists.lock().await.insert(entry.id, entry);
        Ok(())
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<WorklistEntry> {
        self.worklists
            .lock()
            .await
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| LisError::NotFound(format!("worklist entry {} not found", entry_id)))
    }

    async fn update_status(
        &self,
        entry_id: Uuid,
        status: WorklistStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut worklists = self.worklists.lock().await;
        let entry = worklists
            .get_mut(&entry_id)
            .ok_or_else(|| LisError::NotFound(format!("worklist entry {} not found", entry_id)))?;

        entry.status = status;
        entry.error_message = error_message;
        if matches!(
            status,
            WorklistStatus::Sent | WorklistStatus::Acknowledged
        ) && entry.sent_at.is_none()
        {
            entry.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_for_analyzer(&self, analyzer_id: Uuid) -> Result<Vec<WorklistEntry>> {
        let worklists = self.worklists.lock().await;
        Ok(worklists
            .values()
            .filter(|w| w.analyzer_id == analyzer_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::NewOrderItem;
    use lis_core::{ReferenceBounds, ResultFlag};

    fn two_item_order() -> NewOrder {
        NewOrder {
            patient_id: Uuid::new_v4(),
            sample_barcode: Some("BC001".to_string()),
            sample_type: Some("Serum".to_string()),
            items: vec![
                NewOrderItem {
                    test_code: "GLU".to_string(),
                    test_name: "Glucose".to_string(),
                    unit: Some("mmol/L".to_string()),
                    reference_range_text: None,
                    bounds: ReferenceBounds {
                        normal_min: Some(3.9),
                        normal_max: Some(6.1),
                        critical_low: Some(2.2),
                        critical_high: Some(22.2),
                    },
                },
                NewOrderItem {
                    test_code: "K".to_string(),
                    test_name: "Potassium".to_string(),
                    unit: Some("mmol/L".to_string()),
                    reference_range_text: None,
                    bounds: ReferenceBounds::default(),
                },
            ],
        }
    }

    fn update(value: &str, numeric: Option<f64>) -> ResultUpdate {
        ResultUpdate {
            value: value.to_string(),
            numeric,
            flag: numeric.map(|_| ResultFlag::Normal),
            unit: None,
            reference_range_text: None,
            resulted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_result_drives_aggregate_status() {
        let store = MemoryStore::new();
        let order = store.create_order(two_item_order()).await.unwrap();

        let first = store
            .record_result(order.items[0].id, update("5.0", Some(5.0)))
            .await
            .unwrap();
        assert_eq!(first.order_status, OrderStatus::Processing);

        let second = store
            .record_result(order.items[1].id, update("4.1", Some(4.1)))
            .await
            .unwrap();
        assert_eq!(second.order_status, OrderStatus::PendingApproval);

        let reloaded = store.get_order(order.id).await.unwrap();
        assert!(reloaded.processing_ended_at.is_some());
    }

    #[tokio::test]
    async fn test_find_pending_item_skips_approved() {
        let store = MemoryStore::new();
        let order = store.create_order(two_item_order()).await.unwrap();

        let found = store.find_pending_item("BC001", "GLU").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().item_id, order.items[0].id);

        assert!(store
            .find_pending_item("BC001", "NA")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_pending_item("WRONG", "GLU")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_partial_final_approve_keeps_order_open() {
        let store = MemoryStore::new();
        let order = store.create_order(two_item_order()).await.unwrap();

        store
            .record_result(order.items[0].id, update("5.0", Some(5.0)))
            .await
            .unwrap();

        let outcome = store
            .final_approve(order.id, "checked", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome.approved_items, 1);
        assert_eq!(outcome.missing, vec!["K".to_string()]);
        assert!(!outcome.order_approved);

        let reloaded = store.get_order(order.id).await.unwrap();
        assert_eq!(reloaded.items[0].status, ItemStatus::Approved);
        assert_ne!(reloaded.status, OrderStatus::Approved);
        assert!(reloaded.approved_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_approval_reverts_items_and_order() {
        let store = MemoryStore::new();
        let order = store.create_order(two_item_order()).await.unwrap();
        store
            .record_result(order.items[0].id, update("5.0", Some(5.0)))
            .await
            .unwrap();
        store
            .record_result(order.items[1].id, update("4.1", Some(4.1)))
            .await
            .unwrap();
        let outcome = store
            .final_approve(order.id, "ok", Uuid::new_v4())
            .await
            .unwrap();
        assert!(outcome.order_approved);

        let reverted = store.cancel_approval(order.id, "entry mistake").await.unwrap();
        assert_eq!(reverted.status, OrderStatus::PendingApproval);
        assert!(reverted
            .items
            .iter()
            .all(|i| i.status == ItemStatus::HasResult));
        assert!(reverted.approved_at.is_none());
    }

    #[tokio::test]
    async fn test_rerun_demotes_order() {
        let store = MemoryStore::new();
        let order = store.create_order(two_item_order()).await.unwrap();
        store
            .record_result(order.items[0].id, update("5.0", Some(5.0)))
            .await
            .unwrap();
        store
            .record_result(order.items[1].id, update("4.1", Some(4.1)))
            .await
            .unwrap();

        let demoted = store
            .rerun_item(order.items[0].id, "sample hemolyzed")
            .await
            .unwrap();
        assert_eq!(demoted.status, OrderStatus::Processing);

        let item = demoted
            .items
            .iter()
            .find(|i| i.id == order.items[0].id)
            .unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.result_value.is_none());
        assert!(item.flag.is_none());
        assert!(!item.audit_notes.is_empty());
    }

    #[tokio::test]
    async fn test_prior_numeric_result_excludes_current_order() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();

        let mut spec = two_item_order();
        spec.patient_id = patient_id;
        let earlier = store.create_order(spec).await.unwrap();
        store
            .record_result(earlier.items[0].id, update("90.0", Some(90.0)))
            .await
            .unwrap();

        let mut spec = two_item_order();
        spec.patient_id = patient_id;
        spec.sample_barcode = Some("BC002".to_string());
        let current = store.create_order(spec).await.unwrap();

        let prior = store
            .prior_numeric_result(patient_id, "GLU", current.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prior.value, 90.0);
        assert_eq!(prior.order_id, earlier.id);

        // 当前医嘱自身的结果不参与
        assert!(store
            .prior_numeric_result(patient_id, "GLU", earlier.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let store = MemoryStore::new();
        let alert = CriticalValueAlert {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            test_code: "K".to_string(),
            test_name: "Potassium".to_string(),
            value: "6.8".to_string(),
            numeric_value: Some(6.8),
            flag: ResultFlag::CriticalHigh,
            alerted_at: Utc::now(),
            status: AlertStatus::New,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        store.create_alert(alert.clone()).await.unwrap();

        let actor = Uuid::new_v4();
        let first = store.acknowledge(alert.id, actor).await.unwrap();
        assert_eq!(first.status, AlertStatus::Acknowledged);
        assert_eq!(first.acknowledged_by, Some(actor));

        let second = store.acknowledge(alert.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(second.status, AlertStatus::Acknowledged);
        assert_eq!(second.acknowledged_by, Some(actor));
        assert_eq!(second.acknowledged_at, first.acknowledged_at);
    }
}
