//! 错误定义模块

use thiserror::Error;

/// LIS系统统一错误类型
#[derive(Error, Debug)]
pub enum LisError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("报文解析错误: {0}")]
    Decode(String),

    #[error("连接错误: {0}")]
    Connection(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("无效状态转换: 从 {from} 执行 {action}")]
    InvalidStateTransition { from: String, action: String },

    #[error("审核未完成, 以下项目缺少结果: {}", .missing.join(", "))]
    ApprovalIncomplete { missing: Vec<String> },
}

/// LIS系统统一结果类型
pub type Result<T> = std::result::Result<T, LisError>;
