//! HL7报文结构定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HL7消息解析后的结构化数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7Message {
    pub message_type: String,       // MSH-9.1 (ORU, ORM, ACK...)
    pub trigger_event: String,      // MSH-9.2 (R01, O01...)
    pub message_control_id: String, // MSH-10
    pub processing_id: String,      // MSH-11
    pub version_id: String,         // MSH-12
    pub timestamp: Option<DateTime<Utc>>,
    pub segments: Vec<Hl7Segment>,
}

impl Hl7Message {
    /// 按名称取第一个段
    pub fn segment(&self, name: &str) -> Option<&Hl7Segment> {
        self.segments.iter().find(|s| s.name == name)
    }
}

/// HL7段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7Segment {
    pub name: String,
    pub fields: Vec<Hl7Field>,
}

impl Hl7Segment {
    /// 按1-based序号取字段值
    ///
    /// MSH段的字段分隔符本身计为MSH-1, 解析时已补入占位字段,
    /// 因此这里的序号与HL7标准字段编号一致。
    pub fn field(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.fields
            .get(index - 1)
            .map(|f| f.value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// 按1-based序号取字段的某个组件
    pub fn component(&self, field_index: usize, component_index: usize) -> Option<&str> {
        if field_index == 0 || component_index == 0 {
            return None;
        }
        self.fields
            .get(field_index - 1)
            .and_then(|f| f.components.get(component_index - 1))
            .map(|c| c.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// HL7字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7Field {
    pub value: String,
    pub components: Vec<String>,
}

/// 从OBX段展开出的单条观测记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub sample_id: Option<String>,       // OBR-3.1 (样本条码)
    pub patient_id: Option<String>,      // PID-3.1
    pub test_code: String,               // OBX-3.1
    pub test_name: Option<String>,       // OBX-3.2
    pub value: String,                   // OBX-5
    pub unit: Option<String>,            // OBX-6.1
    pub reference_range: Option<String>, // OBX-7
    pub abnormal_flag: Option<String>,   // OBX-8
    pub observed_at: Option<DateTime<Utc>>,
}

/// 发送工作列表(ORM^O01)所需的数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorklistRequest {
    pub message_control_id: Option<String>,
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub sample_id: String, // 样本条码, 同时作为Filler Order Number
    pub placer_order_number: Option<String>,
    pub is_priority: bool,
    pub requested_at: Option<DateTime<Utc>>,
    pub collected_at: Option<DateTime<Utc>>,
    pub tests: Vec<WorklistTest>,
}

/// 工作列表中的单个检验项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorklistTest {
    pub test_code: String,
    pub test_name: String,
}
