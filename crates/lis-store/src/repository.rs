//! 仓储接口定义
//!
//! 医嘱/项目/警报/质控记录是本子系统唯一的共享可变状态,
//! 单个医嘱的汇总状态变更必须在仓储内部串行化:
//! `record_result` 的"写结果 + 重算汇总"要么在同一把锁内完成,
//! 要么在同一事务内以写后读的方式完成, 不允许依赖锁外缓存的计数。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lis_core::{
    AlertFilter, Analyzer, AnalyzerProtocol, ConnectionConfig, ConnectionLogEntry,
    CriticalValueAlert, ItemStatus, LabOrder, LabOrderItem, OrderStatus, QcLevel, QcLot, QcRun,
    RawResult, ReferenceBounds, Result, ResultFlag, TestMapping, WorklistEntry, WorklistStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 新建医嘱参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub patient_id: Uuid,
    pub sample_barcode: Option<String>,
    pub sample_type: Option<String>,
    pub items: Vec<NewOrderItem>,
}

/// 新建医嘱明细参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub test_code: String,
    pub test_name: String,
    pub unit: Option<String>,
    pub reference_range_text: Option<String>,
    pub bounds: ReferenceBounds,
}

/// 新建/更新仪器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSpec {
    pub code: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub protocol: AnalyzerProtocol,
    pub connection: ConnectionConfig,
    pub is_active: bool,
}

/// 新建项目映射参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTestMapping {
    pub analyzer_test_code: String,
    pub analyzer_test_name: Option<String>,
    pub his_test_code: String,
    pub his_test_name: String,
    pub conversion_factor: Option<f64>,
    pub is_active: bool,
}

/// 结果写入参数
#[derive(Debug, Clone)]
pub struct ResultUpdate {
    pub value: String,
    pub numeric: Option<f64>,
    pub flag: Option<ResultFlag>,
    pub unit: Option<String>,                 // 仪器上报时覆盖原单位
    pub reference_range_text: Option<String>, // 仪器上报时覆盖原文本
    pub resulted_at: DateTime<Utc>,
}

/// 结果写入后的快照
#[derive(Debug, Clone)]
pub struct ResultRecorded {
    pub order_id: Uuid,
    pub patient_id: Uuid,
    pub order_status: OrderStatus,
    pub item: LabOrderItem,
}

/// 待配结果的项目定位信息
#[derive(Debug, Clone)]
pub struct PendingItemRef {
    pub order_id: Uuid,
    pub item_id: Uuid,
    pub patient_id: Uuid,
    pub test_code: String,
    pub test_name: String,
    pub bounds: ReferenceBounds,
    pub status: ItemStatus,
}

/// 终审执行结果
///
/// 源系统允许部分终审: 缺结果时已有结果的项目照常置为已审,
/// 但医嘱不进入终态。missing非空即表示发生了部分终审。
#[derive(Debug, Clone)]
pub struct FinalApprovalOutcome {
    pub approved_items: usize,
    pub missing: Vec<String>,
    pub order_approved: bool,
}

/// 患者既往数值结果 (差值核查用)
#[derive(Debug, Clone)]
pub struct PriorResult {
    pub order_id: Uuid,
    pub value: f64,
    pub resulted_at: DateTime<Utc>,
}

/// 医嘱仓储
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create_order(&self, order: NewOrder) -> Result<LabOrder>;

    async fn get_order(&self, order_id: Uuid) -> Result<LabOrder>;

    /// 按 (样本条码, 项目代码) 定位唯一待配项目; 已审项目不再接收结果
    async fn find_pending_item(
        &self,
        barcode: &str,
        test_code: &str,
    ) -> Result<Option<PendingItemRef>>;

    /// 按项目ID定位 (手工录入结果/人工映射用)
    async fn find_item(&self, item_id: Uuid) -> Result<PendingItemRef>;

    /// 写入结果并重算医嘱汇总状态 (同一临界区内)
    async fn record_result(&self, item_id: Uuid, update: ResultUpdate) -> Result<ResultRecorded>;

    /// 初审: 记录技师备注, 医嘱转入初审状态, 不改动项目审核标志
    async fn preliminary_approve(&self, order_id: Uuid, note: &str) -> Result<LabOrder>;

    /// 终审: 有结果的项目全部置为已审; 全部有结果时医嘱终态并盖章
    async fn final_approve(
        &self,
        order_id: Uuid,
        note: &str,
        actor: Uuid,
    ) -> Result<FinalApprovalOutcome>;

    /// 取消审核: 已审项目退回"已有结果", 医嘱退回待审核
    async fn cancel_approval(&self, order_id: Uuid, reason: &str) -> Result<LabOrder>;

    /// 重测: 清空单个项目的结果与分类, 医嘱按需退回检验中
    async fn rerun_item(&self, item_id: Uuid, reason: &str) -> Result<LabOrder>;

    async fn mark_collected(&self, order_id: Uuid, barcode: String) -> Result<LabOrder>;

    async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<LabOrder>;

    /// 同患者同项目最近一次既往数值结果, 排除当前医嘱
    async fn prior_numeric_result(
        &self,
        patient_id: Uuid,
        test_code: &str,
        exclude_order: Uuid,
    ) -> Result<Option<PriorResult>>;
}

/// 原始结果仓储
#[async_trait]
pub trait RawResultStore: Send + Sync {
    async fn save_raw(&self, raw: RawResult) -> Result<()>;

    async fn get_raw(&self, raw_id: Uuid) -> Result<RawResult>;

    async fn list_unmatched(&self, analyzer_id: Option<Uuid>) -> Result<Vec<RawResult>>;

    /// 人工映射到指定项目
    async fn mark_mapped(
        &self,
        raw_id: Uuid,
        item_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<RawResult>;
}

/// 危急值警报仓储
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: CriticalValueAlert) -> Result<CriticalValueAlert>;

    async fn get_alert(&self, alert_id: Uuid) -> Result<CriticalValueAlert>;

    /// 确认警报; 对已确认警报重复确认是无操作, 不报错不重复
    async fn acknowledge(&self, alert_id: Uuid, actor: Uuid) -> Result<CriticalValueAlert>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<CriticalValueAlert>>;
}

/// 质控仓储
#[async_trait]
pub trait QcStore: Send + Sync {
    async fn upsert_lot(&self, lot: QcLot) -> Result<QcLot>;

    async fn get_lot(&self, lot_id: Uuid) -> Result<QcLot>;

    async fn find_lot(
        &self,
        analyzer_id: Uuid,
        test_code: &str,
        level: QcLevel,
    ) -> Result<Option<QcLot>>;

    async fn save_run(&self, run: QcRun) -> Result<()>;

    /// 时间窗内的质控点, 按测定时间升序
    async fn list_runs(
        &self,
        test_code: &str,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QcRun>>;
}

/// 仪器仓储
#[async_trait]
pub trait AnalyzerStore: Send + Sync {
    async fn create_analyzer(&self, spec: AnalyzerSpec) -> Result<Analyzer>;

    async fn update_analyzer(&self, analyzer_id: Uuid, spec: AnalyzerSpec) -> Result<Analyzer>;

    /// 软停用, 仪器记录不物理删除
    async fn deactivate_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer>;

    async fn get_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer>;

    async fn list_analyzers(&self, include_inactive: bool) -> Result<Vec<Analyzer>>;

    /// 整表替换仪器的项目映射
    async fn set_mappings(
        &self,
        analyzer_id: Uuid,
        mappings: Vec<NewTestMapping>,
    ) -> Result<Vec<TestMapping>>;

    async fn mappings_for(&self, analyzer_id: Uuid) -> Result<Vec<TestMapping>>;

    async fn touch_connected(&self, analyzer_id: Uuid) -> Result<()>;

    async fn touch_data_received(&self, analyzer_id: Uuid) -> Result<()>;

    async fn append_connection_log(&self, entry: ConnectionLogEntry) -> Result<()>;

    async fn list_connection_logs(
        &self,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLogEntry>>;
}

/// 工作列表仓储
#[async_trait]
pub trait WorklistStore: Send + Sync {
    async fn save_entry(&self, entry: WorklistEntry) -> Result<()>;

    async fn get_entry(&self, entry_id: Uuid) -> Result<WorklistEntry>;

    async fn update_status(
        &self,
        entry_id: Uuid,
        status: WorklistStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn list_for_analyzer(&self, analyzer_id: Uuid) -> Result<Vec<WorklistEntry>>;
}
