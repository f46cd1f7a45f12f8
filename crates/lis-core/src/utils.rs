//! 通用工具函数

use chrono::Utc;
use uuid::Uuid;

/// 生成样本条码: LIS + 日期 + 申请单号前4位
pub fn generate_sample_barcode(order_id: Uuid) -> String {
    let prefix: String = order_id
        .simple()
        .to_string()
        .chars()
        .take(4)
        .collect::<String>()
        .to_uppercase();
    format!("LIS{}{}", Utc::now().format("%y%m%d"), prefix)
}

/// 解析仪器上报的结果文本为数值
///
/// 仪器偶尔带空白或定性前缀(">", "<"), 带前缀的结果视为非数值。
pub fn parse_numeric_result(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sample_barcode() {
        let barcode = generate_sample_barcode(Uuid::new_v4());
        assert!(barcode.starts_with("LIS"));
        assert_eq!(barcode.len(), 3 + 6 + 4);
    }

    #[test]
    fn test_parse_numeric_result() {
        assert_eq!(parse_numeric_result("4.5"), Some(4.5));
        assert_eq!(parse_numeric_result(" 120 "), Some(120.0));
        assert_eq!(parse_numeric_result(">1000"), None);
        assert_eq!(parse_numeric_result("POSITIVE"), None);
        assert_eq!(parse_numeric_result(""), None);
    }
}
