//! 引脚控制器
//!
//! 以引脚号为下标的槽位数组保存线路句柄与事件处理器。打开、关闭、处理器创建/替换
//! 等结构性变更由一把粗粒度锁串行；已打开引脚的读写只取本槽位的读锁，
//! 不会被其他引脚的结构性变更阻塞。
//!
//! 锁顺序固定为：处理器槽位 -> 结构锁 -> 线路槽位。

use crossbeam::channel::{self, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use pinctl_core::{ControllerConfig, GpioError, Result};

use crate::cancel::CancellationToken;
use crate::event_handler::{Callback, EventHandler};
use crate::handle::{ChipHandle, LineHandle};
use crate::native::ChipOpener;
use crate::types::{
    ListenerId, PinEventTypes, PinInfo, PinMode, PinValue, PinValueChangedEvent,
    WaitForEventResult,
};

#[derive(Default)]
struct PinSlot {
    line: RwLock<Option<Arc<LineHandle>>>,
    handler: Mutex<Option<Arc<EventHandler>>>,
}

pub struct GpioController {
    config: ControllerConfig,
    chip: ChipHandle,
    pins: Box<[PinSlot]>,
    structure: Mutex<()>,
    next_listener: AtomicU64,
    disposed: AtomicBool,
}

impl GpioController {
    /// 通过 Linux 字符设备打开 `config.chip_index` 指定的芯片
    #[cfg(target_os = "linux")]
    pub fn new(config: ControllerConfig) -> Result<Self> {
        Self::with_opener(config, &crate::cdev::CdevOpener)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new(_config: ControllerConfig) -> Result<Self> {
        Err(GpioError::Unavailable(
            "GPIO character devices are only available on Linux".to_string(),
        ))
    }

    pub fn with_opener(config: ControllerConfig, opener: &dyn ChipOpener) -> Result<Self> {
        config.validate()?;

        let chip = ChipHandle::new(config.chip_index, opener.open(config.chip_index)?);
        let pins = (0..chip.pin_count()).map(|_| PinSlot::default()).collect();

        info!(
            chip = config.chip_index,
            pin_count = chip.pin_count(),
            consumer = %config.consumer,
            "GPIO controller ready"
        );

        Ok(Self {
            config,
            chip,
            pins,
            structure: Mutex::new(()),
            next_listener: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn pin_count(&self) -> u32 {
        self.chip.pin_count()
    }

    pub fn open_pin(&self, pin: u32) -> Result<()> {
        let slot = self.slot(pin)?;
        let _guard = self.structure.lock();
        self.ensure_live()?;

        if slot.line.read().is_some() {
            return Ok(());
        }

        let line = self.chip.get_line(pin)?;
        *slot.line.write() = Some(Arc::new(LineHandle::new(pin, line)));

        debug!(pin, "pin opened");
        Ok(())
    }

    /// 仍有监听者时不关闭
    pub fn close_pin(&self, pin: u32) -> Result<()> {
        let slot = self.slot(pin)?;
        let handler = slot.handler.lock();
        if handler.is_some() {
            debug!(pin, "pin still has listeners, keeping it open");
            return Ok(());
        }

        let _guard = self.structure.lock();
        let line = slot.line.write().take();
        if let Some(line) = line {
            line.dispose();
            debug!(pin, "pin closed");
        }
        Ok(())
    }

    pub fn is_pin_open(&self, pin: u32) -> bool {
        self.pins
            .get(pin as usize)
            .is_some_and(|slot| slot.line.read().is_some())
    }

    pub fn is_listening(&self, pin: u32) -> bool {
        self.pins
            .get(pin as usize)
            .is_some_and(|slot| slot.handler.lock().is_some())
    }

    /// `None` 表示引脚已打开但尚未设置模式
    pub fn get_pin_mode(&self, pin: u32) -> Result<Option<PinMode>> {
        Ok(self.open_line(pin)?.mode())
    }

    pub fn set_pin_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        if !Self::is_pin_mode_supported(mode) {
            return Err(GpioError::Unsupported(format!(
                "pin mode {} is not supported by this driver",
                mode
            )));
        }

        let line = self.open_line(pin)?;
        line.set_mode(mode, &self.config.consumer)?;

        debug!(pin, %mode, "pin mode set");
        Ok(())
    }

    pub fn is_pin_mode_supported(mode: PinMode) -> bool {
        !mode.is_pull_resistor()
    }

    pub fn read(&self, pin: u32) -> Result<PinValue> {
        self.open_line(pin)?.read()
    }

    pub fn write(&self, pin: u32, value: PinValue) -> Result<()> {
        self.open_line(pin)?.write(value)
    }

    pub fn toggle(&self, pin: u32) -> Result<PinValue> {
        let line = self.open_line(pin)?;
        let next = !line.read()?;
        line.write(next)?;
        Ok(next)
    }

    pub fn pin_info(&self, pin: u32) -> Result<PinInfo> {
        let line = self.open_line(pin)?;
        Ok(PinInfo {
            number: pin,
            mode: line.mode(),
            value: line.read().ok(),
            listening: self.is_listening(pin),
        })
    }

    pub fn list_pins(&self) -> Vec<PinInfo> {
        (0..self.pin_count())
            .filter(|pin| self.is_pin_open(*pin))
            .filter_map(|pin| self.pin_info(pin).ok())
            .collect()
    }

    /// 本后端没有其他编号方案
    pub fn convert_pin_number_to_logical_numbering_scheme(&self, _pin: u32) -> Result<u32> {
        Err(GpioError::Unsupported(
            "this driver has no alternate pin numbering scheme".to_string(),
        ))
    }

    pub fn add_callback<F>(&self, pin: u32, event_types: PinEventTypes, callback: F) -> Result<ListenerId>
    where
        F: Fn(PinValueChangedEvent) + Send + Sync + 'static,
    {
        validate_event_types(event_types)?;

        let id = self.next_listener_id();
        self.subscribe(pin, id, event_types, Arc::new(callback))?;

        debug!(pin, %id, ?event_types, "callback added");
        Ok(id)
    }

    /// 两个边沿列表都会移除；监听者清空后销毁该引脚的事件处理器，
    /// 并按记录的模式重新申请线路
    pub fn remove_callback(&self, pin: u32, id: ListenerId) -> Result<()> {
        let slot = self.slot(pin)?;

        let emptied = {
            let mut handler = slot.handler.lock();
            let current = handler.as_ref().ok_or_else(|| {
                GpioError::InvalidOperation(format!(
                    "pin {} is not currently listening for events",
                    pin
                ))
            })?;

            current.remove_listener(id);
            if current.is_empty() {
                handler.take()
            } else {
                None
            }
        };

        // 在槽位锁外销毁，后台线程里的回调可能正在访问控制器
        if let Some(handler) = emptied {
            handler.dispose();
            debug!(pin, "last listener removed, event handler destroyed");

            // 期间已有新处理器接管线路时不再申请
            let current = slot.handler.lock();
            if current.is_none() {
                if let Err(e) = handler.line().reapply_mode(&self.config.consumer) {
                    warn!(pin, error = %e, "failed to restore line request after edge watch");
                }
            }
        }

        Ok(())
    }

    /// 阻塞等待一次匹配的边沿，直到调用方取消或事件处理器自身被取消
    pub fn wait_for_event(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        cancel: &CancellationToken,
    ) -> Result<WaitForEventResult> {
        self.wait_until(pin, event_types, cancel, None)
    }

    pub fn wait_for_event_timeout(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        timeout: Duration,
    ) -> Result<WaitForEventResult> {
        self.wait_until(pin, event_types, &CancellationToken::new(), Some(timeout))
    }

    fn wait_until(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<WaitForEventResult> {
        validate_event_types(event_types)?;

        let (tx, rx) = channel::bounded::<PinEventTypes>(1);
        let id = self.next_listener_id();
        let handler = self.subscribe(
            pin,
            id,
            event_types,
            Arc::new(move |event: PinValueChangedEvent| {
                let _ = tx.try_send(event.change);
            }),
        )?;
        let handler_cancel = handler.cancellation().clone();
        drop(handler);

        let deadline = timeout.map_or_else(channel::never, channel::after);

        let result = if cancel.is_cancelled() {
            WaitForEventResult::TimedOut
        } else {
            channel::select! {
                recv(rx) -> edge => match edge {
                    Ok(edge) => WaitForEventResult::Event(edge),
                    Err(_) => WaitForEventResult::TimedOut,
                },
                recv(cancel.receiver()) -> _ => first_edge(&rx),
                recv(handler_cancel.receiver()) -> _ => first_edge(&rx),
                recv(deadline) -> _ => first_edge(&rx),
            }
        };

        // 处理器可能已被并发销毁，此时监听者已随之移除
        match self.remove_callback(pin, id) {
            Ok(()) | Err(GpioError::InvalidOperation(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(result)
    }

    /// 依次销毁事件处理器、线路句柄、芯片，重复调用无副作用
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handlers: Vec<_> = self
            .pins
            .iter()
            .filter_map(|slot| slot.handler.lock().take())
            .collect();
        for handler in &handlers {
            handler.dispose();
        }

        let lines: Vec<_> = {
            let _guard = self.structure.lock();
            self.pins
                .iter()
                .filter_map(|slot| slot.line.write().take())
                .collect()
        };
        for line in &lines {
            line.dispose();
        }

        self.chip.dispose();

        info!(
            chip = self.chip.index(),
            handlers = handlers.len(),
            lines = lines.len(),
            "GPIO controller disposed"
        );
    }

    fn slot(&self, pin: u32) -> Result<&PinSlot> {
        self.pins.get(pin as usize).ok_or_else(|| {
            GpioError::InvalidArgument(format!(
                "pin {} is out of range (pin count {})",
                pin,
                self.pin_count()
            ))
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(GpioError::InvalidOperation(
                "GPIO controller has been disposed".to_string(),
            ));
        }
        Ok(())
    }

    fn open_line(&self, pin: u32) -> Result<Arc<LineHandle>> {
        self.slot(pin)?
            .line
            .read()
            .clone()
            .ok_or_else(|| GpioError::not_open(pin))
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// 在处理器槽位锁内完成订阅，必要时创建处理器
    ///
    /// 订阅与"移除最后一个监听者后销毁"由同一把锁串行，监听者不会挂到已被取走的处理器上。
    /// 后台循环已异常退出的处理器视为失效：用新处理器替换并迁移原有监听者。
    fn subscribe(
        &self,
        pin: u32,
        id: ListenerId,
        event_types: PinEventTypes,
        callback: Callback,
    ) -> Result<Arc<EventHandler>> {
        let slot = self.slot(pin)?;
        let mut current = slot.handler.lock();

        if let Some(handler) = current.as_ref() {
            if !handler.is_terminated() {
                handler.add_listener(id, event_types, callback);
                return Ok(Arc::clone(handler));
            }
        }

        let carried = current.take().map(|stale| {
            debug!(pin, "replacing terminated event handler");
            let listeners = stale.take_listeners();
            stale.dispose();
            listeners
        });

        let handler = self.materialize_handler(pin)?;

        // dispose 先置位再逐个清空槽位，这里持有槽位锁再检查一次
        if let Err(e) = self.ensure_live() {
            handler.dispose();
            return Err(e);
        }

        if let Some(listeners) = carried {
            handler.restore_listeners(listeners);
        }
        handler.add_listener(id, event_types, callback);

        *current = Some(Arc::clone(&handler));
        Ok(handler)
    }

    /// 线路已被占用 (本进程的读写请求或其他使用者) 时先释放旧句柄再重新获取
    fn materialize_handler(&self, pin: u32) -> Result<Arc<EventHandler>> {
        let slot = self.slot(pin)?;
        let _guard = self.structure.lock();
        self.ensure_live()?;

        let mut line = slot
            .line
            .read()
            .clone()
            .ok_or_else(|| GpioError::not_open(pin))?;

        if !line.is_free()? {
            let mode = line.mode();
            line.dispose();

            let fresh = Arc::new(LineHandle::new(pin, self.chip.get_line(pin)?));
            fresh.set_recorded_mode(mode);
            *slot.line.write() = Some(Arc::clone(&fresh));
            line = fresh;

            debug!(pin, "re-acquired line handle for edge detection");
        }

        let handler = EventHandler::start(
            pin,
            line,
            &self.config.consumer,
            self.config.edge_wait_timeout(),
        )?;

        debug!(pin, "event handler created");
        Ok(handler)
    }
}

impl Drop for GpioController {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn validate_event_types(event_types: PinEventTypes) -> Result<()> {
    if event_types.intersects(PinEventTypes::BOTH) {
        Ok(())
    } else {
        Err(GpioError::InvalidArgument(
            "event types must include rising, falling or both".to_string(),
        ))
    }
}

/// 取消与边沿同时到达时以边沿为准
fn first_edge(rx: &channel::Receiver<PinEventTypes>) -> WaitForEventResult {
    match rx.try_recv() {
        Ok(edge) => WaitForEventResult::Event(edge),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => WaitForEventResult::TimedOut,
    }
}
