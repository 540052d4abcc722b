//! Pinctl Core - 核心类型和抽象
//!
//! 提供错误处理、控制器配置与日志初始化等基础功能。

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::*;
