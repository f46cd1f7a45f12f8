//! HL7 v2.x报文解析器
//!
//! 支持ORU(观测结果)、ORM(医嘱/工作列表)、ACK(确认)三类消息。
//! 解析按OBX段隔离错误: 单个坏段不影响同帧其余观测的提取。

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lis_core::{LisError, Result};
use tracing::warn;
use uuid::Uuid;

use crate::message::{Hl7Field, Hl7Message, Hl7Segment, Observation, WorklistRequest};

/// HL7解析器
pub struct Hl7Parser {
    field_separator: char,
    component_separator: char,
    repetition_separator: char,
    escape_character: char,
    subcomponent_separator: char,
}

impl Default for Hl7Parser {
    fn default() -> Self {
        Self {
            field_separator: '|',
            component_separator: '^',
            repetition_separator: '~',
            escape_character: '\\',
            subcomponent_separator: '&',
        }
    }
}

impl Hl7Parser {
    /// 创建新的HL7解析器
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析一帧HL7报文
    pub fn parse(&self, raw: &str) -> Result<Hl7Message> {
        let normalized = Self::strip_mllp(raw).replace("\r\n", "\r").replace('\n', "\r");
        let trimmed = normalized.trim_matches(|c: char| c == '\r' || c.is_whitespace());
        if trimmed.is_empty() {
            return Err(LisError::Decode("empty HL7 message".to_string()));
        }

        let mut segments = Vec::new();
        for segment_str in trimmed.split('\r') {
            let segment_str = segment_str.trim();
            if segment_str.is_empty() {
                continue;
            }
            segments.push(self.parse_segment(segment_str));
        }

        let msh = segments
            .iter()
            .find(|s| s.name == "MSH")
            .ok_or_else(|| LisError::Decode("message has no MSH segment".to_string()))?;

        let message = Hl7Message {
            message_type: msh.component(9, 1).unwrap_or_default().to_string(),
            trigger_event: msh.component(9, 2).unwrap_or_default().to_string(),
            message_control_id: msh.field(10).unwrap_or_default().to_string(),
            processing_id: msh.field(11).unwrap_or_default().to_string(),
            version_id: msh.field(12).unwrap_or_default().to_string(),
            timestamp: msh.field(7).and_then(Self::parse_hl7_timestamp),
            segments: segments.clone(),
        };

        Ok(message)
    }

    /// 解析单个段
    fn parse_segment(&self, line: &str) -> Hl7Segment {
        let parts: Vec<&str> = line.split(self.field_separator).collect();
        let name = parts[0].to_string();
        let mut fields = Vec::new();

        // MSH段的字段分隔符本身算MSH-1, 补一个占位字段保持标准编号
        if name == "MSH" {
            fields.push(Hl7Field {
                value: self.field_separator.to_string(),
                components: vec![self.field_separator.to_string()],
            });
        }

        for part in parts.iter().skip(1) {
            // 重复字段只取第一个重复值做组件拆分
            let first_repeat = part.split(self.repetition_separator).next().unwrap_or(*part);
            fields.push(Hl7Field {
                value: part.to_string(),
                components: first_repeat
                    .split(self.component_separator)
                    .map(|c| c.to_string())
                    .collect(),
            });
        }

        Hl7Segment { name, fields }
    }

    /// 从ORU消息中展开观测记录
    ///
    /// 逐OBX尝试, 坏段记入错误列表后跳过, 不中断整帧处理。
    pub fn parse_observations(&self, message: &Hl7Message) -> (Vec<Observation>, Vec<String>) {
        let mut observations = Vec::new();
        let mut errors = Vec::new();

        let mut current_pid: Option<&Hl7Segment> = None;
        let mut current_obr: Option<&Hl7Segment> = None;

        for segment in &message.segments {
            match segment.name.as_str() {
                "PID" => current_pid = Some(segment),
                "OBR" => current_obr = Some(segment),
                "OBX" => match self.parse_obx(segment, current_pid, current_obr) {
                    Ok(obs) => observations.push(obs),
                    Err(e) => {
                        warn!("skipping malformed OBX segment: {}", e);
                        errors.push(e.to_string());
                    }
                },
                _ => {}
            }
        }

        (observations, errors)
    }

    /// 解析单个OBX段, 结合当前PID/OBR上下文
    fn parse_obx(
        &self,
        obx: &Hl7Segment,
        pid: Option<&Hl7Segment>,
        obr: Option<&Hl7Segment>,
    ) -> Result<Observation> {
        let set_id = obx.field(1).unwrap_or("?");

        let test_code = obx
            .component(3, 1)
            .ok_or_else(|| LisError::Decode(format!("OBX {}: missing test code (OBX-3.1)", set_id)))?
            .to_string();

        let value = obx
            .field(5)
            .ok_or_else(|| LisError::Decode(format!("OBX {}: missing value (OBX-5)", set_id)))?
            .to_string();

        let observed_at = obx
            .field(14)
            .and_then(Self::parse_hl7_timestamp)
            .or_else(|| obr.and_then(|o| o.field(22)).and_then(Self::parse_hl7_timestamp));

        Ok(Observation {
            sample_id: obr
                .and_then(|o| o.component(3, 1))
                .map(|s| s.to_string()),
            patient_id: pid
                .and_then(|p| p.component(3, 1))
                .map(|s| s.to_string()),
            test_code,
            test_name: obx.component(3, 2).map(|s| s.to_string()),
            value,
            unit: obx.component(6, 1).map(|s| s.to_string()),
            reference_range: obx.field(7).map(|s| s.to_string()),
            abnormal_flag: obx.field(8).map(|s| s.to_string()),
            observed_at,
        })
    }

    /// 生成ACK应答报文
    ///
    /// 交换原消息MSH中的收发方, MSA携带被确认消息的控制ID。
    pub fn build_ack(&self, original: &Hl7Message, ack_code: &str, error: Option<&str>) -> String {
        let msh = original.segment("MSH");
        let get = |i: usize| msh.and_then(|m| m.field(i)).unwrap_or("");

        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let control_id: String = Uuid::new_v4().simple().to_string().chars().take(20).collect();
        let trigger = if original.trigger_event.is_empty() {
            "R01"
        } else {
            original.trigger_event.as_str()
        };

        let mut out = String::new();
        out.push_str(&format!(
            "MSH|^~\\&|{}|{}|{}|{}|{}||ACK^{}|{}|{}|{}\r",
            get(5),
            get(6),
            get(3),
            get(4),
            timestamp,
            trigger,
            control_id,
            get(11),
            get(12),
        ));
        out.push_str(&format!(
            "MSA|{}|{}|{}\r",
            ack_code,
            original.message_control_id,
            error.unwrap_or(""),
        ));
        if ack_code != "AA" {
            if let Some(err) = error {
                out.push_str(&format!("ERR|^^^{}||{}\r", ack_code, err));
            }
        }
        out
    }

    /// 生成ORM^O01工作列表报文
    pub fn build_worklist_message(&self, request: &WorklistRequest) -> String {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let control_id = request
            .message_control_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string().chars().take(20).collect());

        let mut out = String::new();

        // MSH
        out.push_str(&format!(
            "MSH|^~\\&|{}|{}|{}|{}|{}||ORM^O01|{}|P|2.5\r",
            request.sending_application.as_deref().unwrap_or("LIS"),
            request.sending_facility.as_deref().unwrap_or("HOSPITAL"),
            request.receiving_application.as_deref().unwrap_or("ANALYZER"),
            request.receiving_facility.as_deref().unwrap_or("LAB"),
            timestamp,
            control_id,
        ));

        // PID
        out.push_str(&format!(
            "PID|1||{}^^^MRN||{}\r",
            request.patient_id,
            request.patient_name.as_deref().unwrap_or(""),
        ));

        // PV1
        out.push_str("PV1|1|O\r");

        // 每个项目一组ORC/OBR
        let priority = if request.is_priority { "S" } else { "R" };
        for (index, test) in request.tests.iter().enumerate() {
            out.push_str(&format!(
                "ORC|NW|{}|{}||SC||||{}\r",
                request
                    .placer_order_number
                    .as_deref()
                    .unwrap_or(&request.sample_id),
                request.sample_id,
                timestamp,
            ));
            out.push_str(&format!(
                "OBR|{}|{}|{}|{}^{}||{}|{}||||||||||||||||||{}\r",
                index + 1,
                request
                    .placer_order_number
                    .as_deref()
                    .unwrap_or(&request.sample_id),
                request.sample_id,
                test.test_code,
                test.test_name,
                request
                    .requested_at
                    .map(|t| t.format("%Y%m%d%H%M%S").to_string())
                    .unwrap_or_else(|| timestamp.clone()),
                request
                    .collected_at
                    .map(|t| t.format("%Y%m%d%H%M%S").to_string())
                    .unwrap_or_default(),
                priority,
            ));
        }

        out
    }

    /// 去掉MLLP帧界符
    ///
    /// MLLP: <VT 0x0B> message <FS 0x1C> <CR 0x0D>
    pub fn strip_mllp(message: &str) -> &str {
        let mut m = message;
        if let Some(rest) = m.strip_prefix('\x0B') {
            m = rest;
        }
        if let Some(rest) = m.strip_suffix('\x0D') {
            if let Some(rest2) = rest.strip_suffix('\x1C') {
                return rest2;
            }
        }
        if let Some(rest) = m.strip_suffix('\x1C') {
            m = rest;
        }
        m
    }

    /// 加上MLLP帧界符
    pub fn wrap_mllp(message: &str) -> String {
        format!("\x0B{}\x1C\x0D", message)
    }

    /// 解析HL7时间戳
    ///
    /// 支持 YYYY / YYYYMM / YYYYMMDD / YYYYMMDDHH / YYYYMMDDHHmm /
    /// YYYYMMDDHHmmss[.S*], 末尾的时区偏移(±ZZZZ)被丢弃。
    pub fn parse_hl7_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        // 丢弃时区偏移
        let mut cleaned = raw;
        if cleaned.len() > 5 {
            let tail = &cleaned[cleaned.len() - 5..];
            if (tail.starts_with('+') || tail.starts_with('-'))
                && tail[1..].chars().all(|c| c.is_ascii_digit())
            {
                cleaned = &cleaned[..cleaned.len() - 5];
            }
        }
        // 丢弃小数秒
        let cleaned = cleaned.split('.').next().unwrap_or(cleaned);

        if !cleaned.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let padded = match cleaned.len() {
            4 => format!("{}0101000000", cleaned),
            6 => format!("{}01000000", cleaned),
            8 => format!("{}000000", cleaned),
            10 => format!("{}0000", cleaned),
            12 => format!("{}00", cleaned),
            14 => cleaned.to_string(),
            _ => return None,
        };

        NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
            .ok()
            .map(|ndt| Utc.from_utc_datetime(&ndt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORU_SAMPLE: &str = "MSH|^~\\&|ANALYZER|LAB|LIS|HOSPITAL|20260115083000||ORU^R01|MSG00123|P|2.5\r\
PID|1||P000123^^^MRN||NGUYEN^VAN A||19800101|M\r\
OBR|1|ORD001|BC20260115A001|PANEL^Basic Panel|||20260115082000|||||||||||||||20260115082900\r\
OBX|1|NM|GLU^Glucose||5.2|mmol/L|3.9-6.1|N|||F|||20260115082500\r\
OBX|2|NM|K^Potassium||6.8|mmol/L|3.5-5.5|H|||F|||20260115082500\r";

    #[test]
    fn test_parse_msh_header() {
        let parser = Hl7Parser::new();
        let message = parser.parse(ORU_SAMPLE).unwrap();

        assert_eq!(message.message_type, "ORU");
        assert_eq!(message.trigger_event, "R01");
        assert_eq!(message.message_control_id, "MSG00123");
        assert_eq!(message.processing_id, "P");
        assert_eq!(message.version_id, "2.5");
        assert!(message.timestamp.is_some());
    }

    #[test]
    fn test_parse_observations_expands_every_obx() {
        let parser = Hl7Parser::new();
        let message = parser.parse(ORU_SAMPLE).unwrap();
        let (observations, errors) = parser.parse_observations(&message);

        assert!(errors.is_empty());
        assert_eq!(observations.len(), 2);

        let glu = &observations[0];
        assert_eq!(glu.test_code, "GLU");
        assert_eq!(glu.test_name.as_deref(), Some("Glucose"));
        assert_eq!(glu.value, "5.2");
        assert_eq!(glu.unit.as_deref(), Some("mmol/L"));
        assert_eq!(glu.sample_id.as_deref(), Some("BC20260115A001"));
        assert_eq!(glu.patient_id.as_deref(), Some("P000123"));
        assert_eq!(glu.abnormal_flag.as_deref(), Some("N"));
        assert!(glu.observed_at.is_some());

        assert_eq!(observations[1].test_code, "K");
        assert_eq!(observations[1].value, "6.8");
    }

    #[test]
    fn test_malformed_obx_is_isolated() {
        // 第二个OBX缺少结果值, 第三个缺少项目代码
        let raw = "MSH|^~\\&|A|L|B|H|20260115083000||ORU^R01|M1|P|2.5\r\
OBR|1|O1|BC001|PANEL\r\
OBX|1|NM|GLU^Glucose||4.4|mmol/L\r\
OBX|2|NM|UREA^Urea||\r\
OBX|3|NM|^NoCode||1.2\r";
        let parser = Hl7Parser::new();
        let message = parser.parse(raw).unwrap();
        let (observations, errors) = parser.parse_observations(&message);

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].test_code, "GLU");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let parser = Hl7Parser::new();
        assert!(parser.parse("").is_err());
        assert!(parser.parse("PID|1|no-msh-here").is_err());
    }

    #[test]
    fn test_mllp_strip_and_wrap() {
        let wrapped = Hl7Parser::wrap_mllp("MSH|^~\\&|X");
        assert!(wrapped.starts_with('\x0B'));
        assert!(wrapped.ends_with("\x1C\x0D"));
        assert_eq!(Hl7Parser::strip_mllp(&wrapped), "MSH|^~\\&|X");
        assert_eq!(Hl7Parser::strip_mllp("MSH|^~\\&|X\x1C"), "MSH|^~\\&|X");
    }

    #[test]
    fn test_parse_wrapped_message() {
        let parser = Hl7Parser::new();
        let wrapped = Hl7Parser::wrap_mllp(ORU_SAMPLE);
        let message = parser.parse(&wrapped).unwrap();
        assert_eq!(message.message_type, "ORU");
    }

    #[test]
    fn test_build_ack_swaps_endpoints() {
        let parser = Hl7Parser::new();
        let message = parser.parse(ORU_SAMPLE).unwrap();
        let ack = parser.build_ack(&message, "AA", None);

        assert!(ack.starts_with("MSH|^~\\&|LIS|HOSPITAL|ANALYZER|LAB|"));
        assert!(ack.contains("|ACK^R01|"));
        assert!(ack.contains("MSA|AA|MSG00123|"));
        assert!(!ack.contains("ERR|"));
    }

    #[test]
    fn test_build_nack_carries_error_segment() {
        let parser = Hl7Parser::new();
        let message = parser.parse(ORU_SAMPLE).unwrap();
        let nack = parser.build_ack(&message, "AE", Some("unknown sample"));
        assert!(nack.contains("MSA|AE|MSG00123|unknown sample"));
        assert!(nack.contains("ERR|^^^AE||unknown sample"));
    }

    #[test]
    fn test_build_worklist_message() {
        let parser = Hl7Parser::new();
        let request = WorklistRequest {
            patient_id: "P000123".to_string(),
            patient_name: Some("NGUYEN^VAN A".to_string()),
            sample_id: "BC20260115A001".to_string(),
            is_priority: true,
            tests: vec![
                crate::message::WorklistTest {
                    test_code: "GLU".to_string(),
                    test_name: "Glucose".to_string(),
                },
                crate::message::WorklistTest {
                    test_code: "K".to_string(),
                    test_name: "Potassium".to_string(),
                },
            ],
            ..Default::default()
        };

        let orm = parser.build_worklist_message(&request);
        assert!(orm.contains("|ORM^O01|"));
        assert!(orm.contains("PID|1||P000123^^^MRN||NGUYEN^VAN A\r"));
        assert_eq!(orm.matches("ORC|NW|").count(), 2);
        assert!(orm.contains("GLU^Glucose"));
        assert!(orm.contains("K^Potassium"));

        // 生成的报文必须能被自己的解析器读回
        let reparsed = parser.parse(&orm).unwrap();
        assert_eq!(reparsed.message_type, "ORM");
    }

    #[test]
    fn test_parse_hl7_timestamp_formats() {
        assert!(Hl7Parser::parse_hl7_timestamp("20260115082500").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("20260115082500.1234").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("202601150825").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("20260115").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("202601").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("2026").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("20260115082500+0700").is_some());
        assert!(Hl7Parser::parse_hl7_timestamp("not-a-date").is_none());
        assert!(Hl7Parser::parse_hl7_timestamp("").is_none());
    }
}
