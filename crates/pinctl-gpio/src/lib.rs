//! Pinctl GPIO - 引脚控制器
//!
//! 管理芯片线路的独占访问、引脚模式与电平，并把边沿事件分发给注册的回调。

pub mod cancel;
#[cfg(target_os = "linux")]
pub mod cdev;
pub mod controller;
pub mod event_handler;
pub mod handle;
pub mod native;
#[cfg(feature = "sim")]
pub mod sim;
pub mod types;

pub use cancel::CancellationToken;
pub use controller::GpioController;
pub use native::{ChipOpener, EdgeWatch, NativeChip, NativeLine};
pub use types::*;

pub use pinctl_core::{ControllerConfig, GpioError, Result};
