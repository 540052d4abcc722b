//! 统一错误处理

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpioError {
    #[error("平台不支持: {0}")]
    Unavailable(String),

    #[error("GPIO 芯片 {chip} 未找到 (os error {})", fmt_code(.os_code))]
    NotFound { chip: u32, os_code: Option<i32> },

    #[error("IO 错误: {message}{} (os error {})", fmt_pin(.pin), fmt_code(.os_code))]
    Io {
        message: String,
        pin: Option<u32>,
        os_code: Option<i32>,
    },

    #[error("无效操作: {0}")]
    InvalidOperation(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("配置文件 IO 错误: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GpioError>;

impl GpioError {
    /// 在失败点立即读取 errno
    pub fn last_os_error(message: impl Into<String>, pin: Option<u32>) -> Self {
        Self::Io {
            message: message.into(),
            pin,
            os_code: std::io::Error::last_os_error().raw_os_error(),
        }
    }

    pub fn chip_not_found(chip: u32) -> Self {
        Self::NotFound {
            chip,
            os_code: std::io::Error::last_os_error().raw_os_error(),
        }
    }

    pub fn not_open(pin: u32) -> Self {
        Self::InvalidOperation(format!("pin {} has not been opened", pin))
    }

    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::NotFound { os_code, .. } | Self::Io { os_code, .. } => *os_code,
            _ => None,
        }
    }

    pub fn pin(&self) -> Option<u32> {
        match self {
            Self::Io { pin, .. } => *pin,
            _ => None,
        }
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

fn fmt_pin(pin: &Option<u32>) -> String {
    pin.map_or_else(String::new, |p| format!(" (引脚 {})", p))
}
