//! # LIS Web
//!
//! 对外REST接口层, 把LabService的操作暴露为HTTP API。

pub mod handlers;
pub mod server;

pub use server::WebServer;
