//! 芯片与线路句柄
//!
//! 包装原生资源，保证每个资源只释放一次。

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use pinctl_core::{GpioError, Result};

use crate::native::{EdgeWatch, NativeChip, NativeLine};
use crate::types::{PinMode, PinValue};

struct LineState {
    line: Option<Box<dyn NativeLine>>,
    mode: Option<PinMode>,
}

/// 一个已打开的引脚
///
/// 读写只取读锁；模式切换与释放取写锁，和其他请求变更串行。
pub struct LineHandle {
    pin: u32,
    state: RwLock<LineState>,
}

impl LineHandle {
    pub fn new(pin: u32, line: Box<dyn NativeLine>) -> Self {
        Self {
            pin,
            state: RwLock::new(LineState {
                line: Some(line),
                mode: None,
            }),
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn mode(&self) -> Option<PinMode> {
        self.state.read().mode
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read().line.is_none()
    }

    pub fn is_free(&self) -> Result<bool> {
        let state = self.state.read();
        match state.line.as_ref() {
            Some(line) => line.is_free(),
            None => Ok(false),
        }
    }

    pub fn set_mode(&self, mode: PinMode, consumer: &str) -> Result<()> {
        let mut state = self.state.write();
        let line = state.line.as_ref().ok_or_else(|| self.released())?;

        request_mode(line.as_ref(), mode, consumer)?;

        state.mode = Some(mode);
        Ok(())
    }

    /// 边沿监视释放后按记录的模式重新申请线路，未设置模式或已释放时无操作
    ///
    /// 输出模式重新申请后电平为低。
    pub fn reapply_mode(&self, consumer: &str) -> Result<()> {
        let state = self.state.write();
        match (state.line.as_ref(), state.mode) {
            (Some(line), Some(mode)) => request_mode(line.as_ref(), mode, consumer),
            _ => Ok(()),
        }
    }

    /// 替换句柄时沿用旧句柄记录的模式
    pub(crate) fn set_recorded_mode(&self, mode: Option<PinMode>) {
        self.state.write().mode = mode;
    }

    pub fn read(&self) -> Result<PinValue> {
        let state = self.state.read();
        let line = state.line.as_ref().ok_or_else(|| self.released())?;
        line.get_value()
    }

    pub fn write(&self, value: PinValue) -> Result<()> {
        let state = self.state.read();
        let line = state.line.as_ref().ok_or_else(|| self.released())?;
        line.set_value(value)
    }

    pub fn watch_edges(&self, consumer: &str) -> Result<Box<dyn EdgeWatch>> {
        let state = self.state.write();
        let line = state.line.as_ref().ok_or_else(|| self.released())?;
        line.watch_edges(consumer)
    }

    /// 释放原生线路，重复调用无副作用
    pub fn dispose(&self) {
        if let Some(line) = self.state.write().line.take() {
            debug!(pin = self.pin, "releasing line");
            drop(line);
        }
    }

    fn released(&self) -> GpioError {
        GpioError::InvalidOperation(format!("line handle for pin {} has been released", self.pin))
    }
}

fn request_mode(line: &dyn NativeLine, mode: PinMode, consumer: &str) -> Result<()> {
    match mode {
        PinMode::Output => line.request_output(consumer, PinValue::Low),
        PinMode::Input => line.request_input(consumer),
        PinMode::InputPullUp | PinMode::InputPullDown => Err(GpioError::Unsupported(format!(
            "pin mode {} is not supported by this driver",
            mode
        ))),
    }
}

impl Drop for LineHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// GPIO 芯片，须在所有线路之后释放
pub struct ChipHandle {
    index: u32,
    pin_count: u32,
    chip: Mutex<Option<Box<dyn NativeChip>>>,
}

impl ChipHandle {
    pub fn new(index: u32, chip: Box<dyn NativeChip>) -> Self {
        Self {
            index,
            pin_count: chip.num_lines(),
            chip: Mutex::new(Some(chip)),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn get_line(&self, pin: u32) -> Result<Box<dyn NativeLine>> {
        let chip = self.chip.lock();
        match chip.as_ref() {
            Some(chip) => chip.get_line(pin),
            None => Err(GpioError::InvalidOperation(format!(
                "GPIO chip {} has been released",
                self.index
            ))),
        }
    }

    pub fn dispose(&self) {
        if let Some(chip) = self.chip.lock().take() {
            debug!(chip = self.index, "releasing chip");
            drop(chip);
        }
    }
}

impl Drop for ChipHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
