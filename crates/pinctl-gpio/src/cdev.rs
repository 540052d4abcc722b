//! Linux GPIO 字符设备后端
//!
//! 基于 gpio-cdev。每条线路同一时刻只持有一个请求：普通读写句柄或边沿事件句柄，
//! 重新请求前先释放旧请求。

use gpio_cdev::{EventRequestFlags, EventType, LineEventHandle, LineRequestFlags};
use parking_lot::Mutex;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use pinctl_core::{GpioError, Result};

use crate::native::{ChipOpener, EdgeWatch, NativeChip, NativeLine};
use crate::types::{PinEventTypes, PinValue};

/// 打开 /dev/gpiochipN
pub struct CdevOpener;

impl ChipOpener for CdevOpener {
    fn open(&self, index: u32) -> Result<Box<dyn NativeChip>> {
        if !has_gpio_chips(Path::new("/dev")) {
            return Err(GpioError::Unavailable(
                "no GPIO character devices found under /dev".to_string(),
            ));
        }

        let path = format!("/dev/gpiochip{}", index);
        let chip = gpio_cdev::Chip::new(&path).map_err(|_| GpioError::chip_not_found(index))?;
        let num_lines = chip.num_lines();

        debug!(path = %path, num_lines, "opened GPIO chip");

        Ok(Box::new(CdevChip {
            chip: Mutex::new(chip),
            num_lines,
        }))
    }
}

fn has_gpio_chips(dev: &Path) -> bool {
    fs::read_dir(dev)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with("gpiochip"))
        })
        .unwrap_or(false)
}

struct CdevChip {
    chip: Mutex<gpio_cdev::Chip>,
    num_lines: u32,
}

impl NativeChip for CdevChip {
    fn num_lines(&self) -> u32 {
        self.num_lines
    }

    fn get_line(&self, offset: u32) -> Result<Box<dyn NativeLine>> {
        let line = self
            .chip
            .lock()
            .get_line(offset)
            .map_err(|_| GpioError::last_os_error("failed to get line", Some(offset)))?;

        Ok(Box::new(CdevLine {
            line,
            request: Mutex::new(CdevRequest::Released),
        }))
    }
}

enum CdevRequest {
    Released,
    Handle(gpio_cdev::LineHandle),
    // 事件句柄由 CdevEdgeWatch 独占，监视结束即释放
    Watched(Weak<Mutex<LineEventHandle>>),
}

struct CdevLine {
    line: gpio_cdev::Line,
    request: Mutex<CdevRequest>,
}

impl CdevLine {
    fn offset_u32(&self) -> u32 {
        self.line.offset()
    }

    fn request_handle(&self, flags: LineRequestFlags, default: u8, consumer: &str) -> Result<()> {
        let kind = format!("{:?}", flags);
        let mut request = self.request.lock();
        *request = CdevRequest::Released;

        let handle = self.line.request(flags, default, consumer).map_err(|_| {
            GpioError::last_os_error(
                format!("failed to request line as {}", kind),
                Some(self.offset_u32()),
            )
        })?;

        *request = CdevRequest::Handle(handle);
        Ok(())
    }
}

impl NativeLine for CdevLine {
    fn offset(&self) -> u32 {
        self.offset_u32()
    }

    fn is_free(&self) -> Result<bool> {
        let request = self.request.lock();
        match &*request {
            CdevRequest::Handle(_) => Ok(false),
            CdevRequest::Watched(events) if events.strong_count() > 0 => Ok(false),
            _ => {
                let info = self.line.info().map_err(|_| {
                    GpioError::last_os_error("failed to read line info", Some(self.offset_u32()))
                })?;
                Ok(!info.is_kernel() && info.consumer().is_none())
            }
        }
    }

    fn request_input(&self, consumer: &str) -> Result<()> {
        self.request_handle(LineRequestFlags::INPUT, 0, consumer)
    }

    fn request_output(&self, consumer: &str, initial: PinValue) -> Result<()> {
        self.request_handle(LineRequestFlags::OUTPUT, initial.as_u8(), consumer)
    }

    fn get_value(&self) -> Result<PinValue> {
        let request = self.request.lock();
        let value = match &*request {
            CdevRequest::Handle(handle) => handle.get_value(),
            CdevRequest::Watched(events) => match events.upgrade() {
                Some(events) => events.lock().get_value(),
                None => return Err(not_requested(self.offset_u32())),
            },
            CdevRequest::Released => return Err(not_requested(self.offset_u32())),
        };

        value
            .map(PinValue::from)
            .map_err(|_| GpioError::last_os_error("failed to read line value", Some(self.offset_u32())))
    }

    fn set_value(&self, value: PinValue) -> Result<()> {
        let request = self.request.lock();
        match &*request {
            CdevRequest::Handle(handle) => handle.set_value(value.as_u8()).map_err(|_| {
                GpioError::last_os_error("failed to set line value", Some(self.offset_u32()))
            }),
            _ => Err(not_requested(self.offset_u32())),
        }
    }

    fn watch_edges(&self, consumer: &str) -> Result<Box<dyn EdgeWatch>> {
        let mut request = self.request.lock();
        *request = CdevRequest::Released;

        let events = self
            .line
            .events(
                LineRequestFlags::INPUT,
                EventRequestFlags::BOTH_EDGES,
                consumer,
            )
            .map_err(|_| {
                GpioError::last_os_error("failed to request edge events", Some(self.offset_u32()))
            })?;

        let events = Arc::new(Mutex::new(events));
        *request = CdevRequest::Watched(Arc::downgrade(&events));

        Ok(Box::new(CdevEdgeWatch {
            offset: self.offset_u32(),
            events,
        }))
    }
}

struct CdevEdgeWatch {
    offset: u32,
    events: Arc<Mutex<LineEventHandle>>,
}

impl EdgeWatch for CdevEdgeWatch {
    fn wait(&mut self, timeout: Duration) -> Result<Option<PinEventTypes>> {
        // poll 期间不持锁，同一线路上的读值不被阻塞
        let fd = self.events.lock().as_raw_fd();
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: pfd 是栈上有效的单个 pollfd，nfds 为 1；fd 由 self.events 持有，
        // 在 poll 返回前不会被关闭
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(GpioError::Io {
                message: "poll on edge events failed".to_string(),
                pin: Some(self.offset),
                os_code: err.raw_os_error(),
            });
        }
        if rc == 0 {
            return Ok(None);
        }

        let event = self
            .events
            .lock()
            .get_event()
            .map_err(|_| GpioError::last_os_error("failed to read edge event", Some(self.offset)))?;

        Ok(Some(match event.event_type() {
            EventType::RisingEdge => PinEventTypes::RISING,
            EventType::FallingEdge => PinEventTypes::FALLING,
        }))
    }
}

fn not_requested(pin: u32) -> GpioError {
    GpioError::Io {
        message: "line has not been requested".to_string(),
        pin: Some(pin),
        os_code: None,
    }
}
