//! 原生芯片访问接口
//!
//! 对底层 GPIO 库的同步抽象。释放资源即 drop 对应对象。

use std::time::Duration;

use pinctl_core::Result;

use crate::types::{PinEventTypes, PinValue};

/// 按序号打开芯片
pub trait ChipOpener {
    fn open(&self, index: u32) -> Result<Box<dyn NativeChip>>;
}

pub trait NativeChip: Send + Sync {
    fn num_lines(&self) -> u32;

    fn get_line(&self, offset: u32) -> Result<Box<dyn NativeLine>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait NativeLine: Send + Sync {
    fn offset(&self) -> u32;

    /// 本进程与其他使用者都未占用该线路
    fn is_free(&self) -> Result<bool>;

    fn request_input(&self, consumer: &str) -> Result<()>;

    fn request_output(&self, consumer: &str, initial: PinValue) -> Result<()>;

    fn get_value(&self) -> Result<PinValue>;

    fn set_value(&self, value: PinValue) -> Result<()>;

    /// 以双边沿检测方式重新申请线路
    fn watch_edges(&self, consumer: &str) -> Result<Box<dyn EdgeWatch>>;
}

pub trait EdgeWatch: Send {
    /// 最多阻塞 `timeout`，超时返回 `None`
    fn wait(&mut self, timeout: Duration) -> Result<Option<PinEventTypes>>;
}
