//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 仪器通信协议
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AnalyzerProtocol {
    Hl7V2,    // HL7 v2.x (MLLP)
    Astm1394, // ASTM E1394, 暂无解码器
}

/// 仪器连接方式及参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// TCP服务端: 等待仪器主动连接
    Listen { bind: String, port: u16 },
    /// TCP客户端: 主动连接仪器
    Connect { host: String, port: u16 },
    /// 串口 (RS232)
    Serial { path: String, baud_rate: u32 },
}

/// 连接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected, // 未连接
    Listening,    // 监听中
    Connected,    // 已连接
    Error,        // 故障
}

/// 检验仪器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analyzer {
    pub id: Uuid,
    pub code: String,                  // 仪器编码
    pub name: String,                  // 仪器名称
    pub manufacturer: Option<String>,  // 厂商
    pub model: Option<String>,         // 型号
    pub protocol: AnalyzerProtocol,    // 通信协议
    pub connection: ConnectionConfig,  // 连接参数
    pub is_active: bool,               // 停用仪器不会被物理删除
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_data_received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 仪器通道代码与院内标准项目代码的映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMapping {
    pub id: Uuid,
    pub analyzer_id: Uuid,
    pub analyzer_test_code: String,        // 仪器侧项目代码
    pub analyzer_test_name: Option<String>,
    pub his_test_code: String,             // 院内标准项目代码
    pub his_test_name: String,
    pub conversion_factor: Option<f64>,    // 数值换算系数
    pub is_active: bool,
}

/// 医嘱(检验申请单)状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,             // 已开单
    Collected,           // 已采样
    Processing,          // 检验中
    PendingApproval,     // 待审核
    PreliminaryApproved, // 初审(技师)
    Approved,            // 已审核
    Cancelled,           // 已取消
}

/// 检验项目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,   // 待结果
    HasResult, // 已有结果
    Approved,  // 已审核
}

/// 结果分类标志
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResultFlag {
    Normal,
    Low,
    High,
    CriticalLow,
    CriticalHigh,
}

impl ResultFlag {
    /// 是否为危急值
    pub fn is_critical(&self) -> bool {
        matches!(self, ResultFlag::CriticalLow | ResultFlag::CriticalHigh)
    }
}

/// 参考范围边界比较策略
///
/// 临床惯例按严格不等式处理: 恰好落在边界上的值视为正常。
/// 部分科室要求边界值计入异常, 故保留可配置项。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BoundaryPolicy {
    Strict,    // value == 边界 → 正常
    Inclusive, // value == 边界 → 异常
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        BoundaryPolicy::Strict
    }
}

/// 检验项目的参考范围与危急值边界
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReferenceBounds {
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
    pub critical_low: Option<f64>,
    pub critical_high: Option<f64>,
}

impl ReferenceBounds {
    /// 对数值结果分类
    ///
    /// 判定优先级: 危急低 → 危急高 → 偏低 → 偏高 → 正常。
    /// 危急边界先于普通边界判定, 危急高的值不会被降级为"偏高"。
    pub fn classify(&self, value: f64, policy: BoundaryPolicy) -> ResultFlag {
        let below = |bound: f64| match policy {
            BoundaryPolicy::Strict => value < bound,
            BoundaryPolicy::Inclusive => value <= bound,
        };
        let above = |bound: f64| match policy {
            BoundaryPolicy::Strict => value > bound,
            BoundaryPolicy::Inclusive => value >= bound,
        };

        if let Some(cl) = self.critical_low {
            if below(cl) {
                return ResultFlag::CriticalLow;
            }
        }
        if let Some(ch) = self.critical_high {
            if above(ch) {
                return ResultFlag::CriticalHigh;
            }
        }
        if let Some(min) = self.normal_min {
            if below(min) {
                return ResultFlag::Low;
            }
        }
        if let Some(max) = self.normal_max {
            if above(max) {
                return ResultFlag::High;
            }
        }
        ResultFlag::Normal
    }
}

/// 检验医嘱
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabOrder {
    pub id: Uuid,
    pub order_code: String,               // 申请单号
    pub patient_id: Uuid,
    pub sample_barcode: Option<String>,   // 样本条码, 采样时生成
    pub sample_type: Option<String>,      // 血清/尿液/...
    pub status: OrderStatus,
    pub ordered_at: DateTime<Utc>,
    pub collected_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub technician_note: Option<String>,  // 初审备注
    pub doctor_note: Option<String>,      // 终审备注
    pub audit_notes: Vec<String>,         // 取消审核/重测等操作留痕
    pub items: Vec<LabOrderItem>,
}

impl LabOrder {
    /// 按项目状态重算医嘱汇总状态
    ///
    /// 汇总状态是项目状态的确定函数, 不允许独立设置。
    /// Cancelled/PreliminaryApproved/Approved 属于显式覆盖状态,
    /// 只能由取消、初审、终审、重测等操作改变, 重算不触碰。
    pub fn recompute_status(&mut self, now: DateTime<Utc>) {
        match self.status {
            OrderStatus::Cancelled
            | OrderStatus::PreliminaryApproved
            | OrderStatus::Approved => return,
            _ => {}
        }

        if self.items.is_empty() {
            return;
        }

        let all_resulted = self
            .items
            .iter()
            .all(|i| matches!(i.status, ItemStatus::HasResult | ItemStatus::Approved));

        if all_resulted {
            if self.status != OrderStatus::PendingApproval {
                self.status = OrderStatus::PendingApproval;
                if self.processing_ended_at.is_none() {
                    self.processing_ended_at = Some(now);
                }
            }
        } else if self
            .items
            .iter()
            .any(|i| matches!(i.status, ItemStatus::HasResult | ItemStatus::Approved))
            || matches!(
                self.status,
                OrderStatus::Processing | OrderStatus::PendingApproval
            )
        {
            self.status = OrderStatus::Processing;
            if self.processing_started_at.is_none() {
                self.processing_started_at = Some(now);
            }
        }
    }
}

/// 检验医嘱明细项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub test_code: String,                    // 院内标准项目代码
    pub test_name: String,
    pub unit: Option<String>,
    pub reference_range_text: Option<String>, // 报告展示用文本
    pub bounds: ReferenceBounds,
    pub result_value: Option<String>,         // 原始结果文本
    pub numeric_result: Option<f64>,          // 可解析时的数值结果
    pub flag: Option<ResultFlag>,             // None = 未分类(非数值结果)
    pub status: ItemStatus,
    pub resulted_at: Option<DateTime<Utc>>,
    pub audit_notes: Vec<String>,             // 重测原因等审计备注
}

/// 原始结果处理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RawResultStatus {
    Pending,        // 未匹配, 等待人工映射
    Matched,        // 自动匹配成功
    ManuallyMapped, // 人工映射
    Ignored,        // 已忽略
}

/// 仪器上传的原始结果记录
///
/// 无论是否匹配成功都会留存, 供审计与人工映射使用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResult {
    pub id: Uuid,
    pub analyzer_id: Uuid,
    pub sample_id: Option<String>,    // 仪器上报的样本号/条码
    pub patient_id: Option<String>,   // 仪器上报的患者标识(文本)
    pub test_code: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub flag: Option<String>,         // 仪器自带异常标志 (H/L/HH/LL...)
    pub observed_at: Option<DateTime<Utc>>,
    pub raw_message: String,          // 原始报文
    pub status: RawResultStatus,
    pub matched_item_id: Option<Uuid>,
    pub mapped_at: Option<DateTime<Utc>>,
    pub mapped_by: Option<Uuid>,
    pub received_at: DateTime<Utc>,
}

/// 危急值警报状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AlertStatus {
    New,          // 未确认
    Acknowledged, // 已确认
}

/// 危急值警报
///
/// 每条触发结果只生成一条警报, 不会自动解除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalValueAlert {
    pub id: Uuid,
    pub item_id: Uuid,
    pub order_id: Uuid,
    pub patient_id: Uuid,
    pub test_code: String,
    pub test_name: String,
    pub value: String,
    pub numeric_value: Option<f64>,
    pub flag: ResultFlag, // CriticalLow | CriticalHigh
    pub alerted_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
}

/// 危急值警报查询条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub acknowledged: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 质控水平
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QcLevel {
    Level1,
    Level2,
    Level3,
}

/// 质控品批次: 某仪器某项目的靶值与标准差
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcLot {
    pub id: Uuid,
    pub analyzer_id: Uuid,
    pub test_code: String,
    pub level: QcLevel,
    pub lot_number: String,
    pub mean: f64, // 靶值
    pub sd: f64,   // 标准差
    pub is_active: bool,
}

/// 一次质控测定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcRun {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub analyzer_id: Uuid,
    pub test_code: String,
    pub level: QcLevel,
    pub value: f64,
    pub z_score: f64,
    pub cv: f64,                       // 变异系数 = SD/Mean*100
    pub accepted: bool,
    pub violated_rule: Option<String>, // "1-3s" / "1-2s"
    pub run_at: DateTime<Utc>,
    pub performed_by: Option<Uuid>,
}

/// 工作列表条目发送状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorklistStatus {
    Pending,      // 待发送
    Sent,         // 已发送
    Acknowledged, // 仪器已确认
    Failed,       // 发送失败
}

/// 发送给仪器的工作列表条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorklistEntry {
    pub id: Uuid,
    pub analyzer_id: Uuid,
    pub order_id: Uuid,
    pub sample_barcode: Option<String>,
    pub test_codes: Vec<String>,
    pub message_control_id: String,
    pub status: WorklistStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

/// 连接事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Listening,
    DataReceived,
    DataSent,
    Error,
}

/// 仪器连接日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub id: Uuid,
    pub analyzer_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: ConnectionEventKind,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> ReferenceBounds {
        ReferenceBounds {
            normal_min: Some(3.5),
            normal_max: Some(5.5),
            critical_low: Some(2.0),
            critical_high: Some(7.0),
        }
    }

    #[test]
    fn test_classify_precedence() {
        let b = bounds();
        assert_eq!(
            b.classify(1.5, BoundaryPolicy::Strict),
            ResultFlag::CriticalLow
        );
        assert_eq!(
            b.classify(8.2, BoundaryPolicy::Strict),
            ResultFlag::CriticalHigh
        );
        assert_eq!(b.classify(3.0, BoundaryPolicy::Strict), ResultFlag::Low);
        assert_eq!(b.classify(6.0, BoundaryPolicy::Strict), ResultFlag::High);
        assert_eq!(b.classify(4.5, BoundaryPolicy::Strict), ResultFlag::Normal);
    }

    #[test]
    fn test_classify_boundary_is_normal_under_strict() {
        let b = bounds();
        // 恰好落在参考范围边界上的值按严格不等式归为正常
        assert_eq!(b.classify(3.5, BoundaryPolicy::Strict), ResultFlag::Normal);
        assert_eq!(b.classify(5.5, BoundaryPolicy::Strict), ResultFlag::Normal);
        // 恰好等于危急边界的值不算危急, 但仍超出参考范围
        assert_eq!(b.classify(2.0, BoundaryPolicy::Strict), ResultFlag::Low);
        assert_eq!(b.classify(7.0, BoundaryPolicy::Strict), ResultFlag::High);
    }

    #[test]
    fn test_classify_boundary_under_inclusive() {
        let b = bounds();
        assert_eq!(
            b.classify(2.0, BoundaryPolicy::Inclusive),
            ResultFlag::CriticalLow
        );
        assert_eq!(
            b.classify(7.0, BoundaryPolicy::Inclusive),
            ResultFlag::CriticalHigh
        );
        assert_eq!(b.classify(3.5, BoundaryPolicy::Inclusive), ResultFlag::Low);
        assert_eq!(b.classify(5.5, BoundaryPolicy::Inclusive), ResultFlag::High);
    }

    #[test]
    fn test_classify_critical_beats_high() {
        let b = bounds();
        // 危急高优先于偏高
        assert_eq!(
            b.classify(100.0, BoundaryPolicy::Strict),
            ResultFlag::CriticalHigh
        );
    }

    #[test]
    fn test_classify_missing_bounds() {
        let b = ReferenceBounds {
            normal_min: Some(3.5),
            normal_max: Some(5.5),
            critical_low: None,
            critical_high: None,
        };
        assert_eq!(b.classify(1.0, BoundaryPolicy::Strict), ResultFlag::Low);
        assert_eq!(b.classify(9.0, BoundaryPolicy::Strict), ResultFlag::High);
    }

    #[test]
    fn test_recompute_status() {
        let now = Utc::now();
        let mut order = LabOrder {
            id: Uuid::new_v4(),
            order_code: "LAB0001".to_string(),
            patient_id: Uuid::new_v4(),
            sample_barcode: Some("BC001".to_string()),
            sample_type: None,
            status: OrderStatus::Processing,
            ordered_at: now,
            collected_at: Some(now),
            processing_started_at: Some(now),
            processing_ended_at: None,
            approved_at: None,
            approved_by: None,
            technician_note: None,
            doctor_note: None,
            audit_notes: Vec::new(),
            items: vec![
                item_with_status(ItemStatus::HasResult),
                item_with_status(ItemStatus::Pending),
            ],
        };

        order.recompute_status(now);
        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.processing_ended_at.is_none());

        order.items[1].status = ItemStatus::HasResult;
        order.recompute_status(now);
        assert_eq!(order.status, OrderStatus::PendingApproval);
        assert!(order.processing_ended_at.is_some());
    }

    #[test]
    fn test_recompute_does_not_touch_override_states() {
        let now = Utc::now();
        let mut order = LabOrder {
            id: Uuid::new_v4(),
            order_code: "LAB0002".to_string(),
            patient_id: Uuid::new_v4(),
            sample_barcode: None,
            sample_type: None,
            status: OrderStatus::PreliminaryApproved,
            ordered_at: now,
            collected_at: None,
            processing_started_at: None,
            processing_ended_at: None,
            approved_at: None,
            approved_by: None,
            technician_note: None,
            doctor_note: None,
            audit_notes: Vec::new(),
            items: vec![item_with_status(ItemStatus::HasResult)],
        };

        order.recompute_status(now);
        assert_eq!(order.status, OrderStatus::PreliminaryApproved);
    }

    fn item_with_status(status: ItemStatus) -> LabOrderItem {
        LabOrderItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            test_code: "GLU".to_string(),
            test_name: "Glucose".to_string(),
            unit: None,
            reference_range_text: None,
            bounds: ReferenceBounds::default(),
            result_value: None,
            numeric_result: None,
            flag: None,
            status,
            resulted_at: None,
            audit_notes: Vec::new(),
        }
    }
}
