//! 控制器配置
//!
//! 配置以 JSON 保存，文件不存在时使用默认值

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{GpioError, Result};

/// 引脚控制器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// GPIO 芯片序号，对应 /dev/gpiochipN
    pub chip_index: u32,
    /// 申请线路时附带的 consumer 标签
    pub consumer: String,
    /// 事件循环中单次边沿等待的上限 (毫秒)，决定取消信号被观察到的最长延迟
    pub edge_wait_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            chip_index: 0,
            consumer: default_consumer(),
            edge_wait_timeout_ms: 100,
        }
    }
}

impl ControllerConfig {
    pub fn new(chip_index: u32) -> Self {
        Self {
            chip_index,
            ..Self::default()
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_edge_wait_timeout(mut self, timeout: Duration) -> Self {
        self.edge_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn edge_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.edge_wait_timeout_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.is_empty() {
            return Err(GpioError::Config("consumer label must not be empty".to_string()));
        }
        if self.edge_wait_timeout_ms == 0 {
            return Err(GpioError::Config(
                "edge_wait_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pinctl")
            .join("config.json")
    }
}

/// 进程标识，形如 `pinctl[1234]`
pub fn default_consumer() -> String {
    let name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "pinctl".to_string());

    format!("{}[{}]", name, std::process::id())
}
