//! GPIO 基础类型
//!
//! 引脚模式、电平、边沿事件类型与等待结果

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Not;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    Input,
    Output,
    InputPullUp,
    InputPullDown,
}

impl PinMode {
    pub fn is_pull_resistor(&self) -> bool {
        matches!(self, Self::InputPullUp | Self::InputPullDown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::InputPullUp => "input_pull_up",
            Self::InputPullDown => "input_pull_down",
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinValue {
    Low,
    High,
}

impl PinValue {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }
}

impl From<bool> for PinValue {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

impl From<u8> for PinValue {
    fn from(value: u8) -> Self {
        Self::from(value != 0)
    }
}

impl Not for PinValue {
    type Output = PinValue;

    fn not(self) -> PinValue {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

bitflags::bitflags! {
    /// 边沿事件类型，可组合
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PinEventTypes: u8 {
        const RISING = 0b01;
        const FALLING = 0b10;
    }
}

impl PinEventTypes {
    pub const BOTH: Self = Self::RISING.union(Self::FALLING);
}

/// 边沿回调收到的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinValueChangedEvent {
    pub pin: u32,
    pub change: PinEventTypes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForEventResult {
    /// 取消或超时，期间没有匹配的边沿
    TimedOut,
    Event(PinEventTypes),
}

impl WaitForEventResult {
    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn event_types(&self) -> PinEventTypes {
        match self {
            Self::TimedOut => PinEventTypes::empty(),
            Self::Event(types) => *types,
        }
    }
}

/// 回调注册标识，remove_callback 按此移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinInfo {
    pub number: u32,
    pub mode: Option<PinMode>,
    pub value: Option<PinValue>,
    pub listening: bool,
}
