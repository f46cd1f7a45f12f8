//! # LIS Protocol
//!
//! 检验仪器通信层: HL7 v2.x报文解析、MLLP帧编解码、仪器连接管理。

pub mod codec;
pub mod manager;
pub mod message;
pub mod parser;

pub use codec::MllpCodec;
pub use manager::{AnalyzerEvent, ConnectionManager};
pub use message::{Hl7Message, Hl7Segment, Observation, WorklistRequest, WorklistTest};
pub use parser::Hl7Parser;
