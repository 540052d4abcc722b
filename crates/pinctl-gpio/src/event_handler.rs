//! 边沿事件处理器
//!
//! 每个被监听的引脚一个实例：独占一个边沿监视资源，后台线程循环等待边沿，
//! 并把上升沿/下降沿分发给对应的回调列表。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use pinctl_core::{GpioError, Result};

use crate::cancel::CancellationToken;
use crate::handle::LineHandle;
use crate::native::EdgeWatch;
use crate::types::{ListenerId, PinEventTypes, PinValueChangedEvent};

pub type Callback = Arc<dyn Fn(PinValueChangedEvent) + Send + Sync>;

type SharedWatch = Arc<Mutex<Option<Box<dyn EdgeWatch>>>>;

/// 上升沿与下降沿两个独立的有序订阅列表
#[derive(Default, Clone)]
pub struct Listeners {
    rising: Vec<(ListenerId, Callback)>,
    falling: Vec<(ListenerId, Callback)>,
}

impl Listeners {
    pub fn add(&mut self, id: ListenerId, types: PinEventTypes, callback: Callback) {
        if types.contains(PinEventTypes::RISING) && !contains(&self.rising, id) {
            self.rising.push((id, callback.clone()));
        }
        if types.contains(PinEventTypes::FALLING) && !contains(&self.falling, id) {
            self.falling.push((id, callback));
        }
    }

    /// 两个列表都移除，不存在时无操作
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.len();
        self.rising.retain(|(other, _)| *other != id);
        self.falling.retain(|(other, _)| *other != id);
        before != self.len()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        contains(&self.rising, id) || contains(&self.falling, id)
    }

    pub fn len(&self) -> usize {
        self.rising.len() + self.falling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rising.is_empty() && self.falling.is_empty()
    }

    fn for_edge(&self, edge: PinEventTypes) -> Vec<Callback> {
        let list = if edge == PinEventTypes::RISING {
            &self.rising
        } else {
            &self.falling
        };
        list.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

fn contains(list: &[(ListenerId, Callback)], id: ListenerId) -> bool {
    list.iter().any(|(other, _)| *other == id)
}

pub struct EventHandler {
    pin: u32,
    line: Arc<LineHandle>,
    listeners: Arc<Mutex<Listeners>>,
    watch: SharedWatch,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl EventHandler {
    /// 申请边沿监视并立即启动后台循环
    ///
    /// `line` 仍归控制器所有，处理器只借用它，从不释放它。
    pub fn start(
        pin: u32,
        line: Arc<LineHandle>,
        consumer: &str,
        wait_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let watch: SharedWatch = Arc::new(Mutex::new(Some(line.watch_edges(consumer)?)));
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let cancel = CancellationToken::new();

        let worker = {
            let listeners = Arc::clone(&listeners);
            let watch = Arc::clone(&watch);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("pinctl-edge-{}", pin))
                .spawn(move || run_edge_loop(pin, watch, listeners, cancel, wait_timeout))
                .map_err(|e| GpioError::Io {
                    message: format!("failed to spawn edge worker: {}", e),
                    pin: Some(pin),
                    os_code: e.raw_os_error(),
                })?
        };

        debug!(pin, "event handler started");

        Ok(Arc::new(Self {
            pin,
            line,
            listeners,
            watch,
            cancel,
            worker: Mutex::new(Some(worker)),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn line(&self) -> &Arc<LineHandle> {
        &self.line
    }

    pub fn add_listener(&self, id: ListenerId, types: PinEventTypes, callback: Callback) {
        self.listeners.lock().add(id, types, callback);
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(id)
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().contains(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub(crate) fn take_listeners(&self) -> Listeners {
        std::mem::take(&mut *self.listeners.lock())
    }

    pub(crate) fn restore_listeners(&self, listeners: Listeners) {
        let mut current = self.listeners.lock();
        for (id, cb) in listeners.rising {
            current.add(id, PinEventTypes::RISING, cb);
        }
        for (id, cb) in listeners.falling {
            current.add(id, PinEventTypes::FALLING, cb);
        }
    }

    /// 内部取消信号：处理器被销毁或循环异常退出时触发
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 后台循环已退出 (例如原生等待失败)，处理器不再产生事件
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 停止后台循环并释放监视资源，返回时监视资源已释放
    ///
    /// 在后台线程自身 (回调内) 调用时不 join，循环在回调返回后退出。
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                debug!(pin = self.pin, "event handler disposed from its own callback");
            } else if worker.join().is_err() {
                warn!(pin = self.pin, "edge worker panicked");
            }
        }

        // 循环只在等待期间持有监视锁，回调内调用时这里不会阻塞
        drop(self.watch.lock().take());

        // 监听者持有的发送端随列表一起丢弃，等待者随即被唤醒
        self.listeners.lock().rising.clear();
        self.listeners.lock().falling.clear();

        debug!(pin = self.pin, "event handler disposed");
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_edge_loop(
    pin: u32,
    watch: SharedWatch,
    listeners: Arc<Mutex<Listeners>>,
    cancel: CancellationToken,
    wait_timeout: Duration,
) {
    while !cancel.is_cancelled() {
        let next = match watch.lock().as_mut() {
            Some(watch) => watch.wait(wait_timeout),
            None => break,
        };
        match next {
            Ok(Some(edge)) => {
                if cancel.is_cancelled() {
                    break;
                }
                let callbacks = listeners.lock().for_edge(edge);
                let event = PinValueChangedEvent { pin, change: edge };
                for callback in callbacks {
                    callback(event);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(pin, error = %e, "edge wait failed, stopping event loop");
                cancel.cancel();
                break;
            }
        }
    }

    drop(watch.lock().take());
    debug!(pin, "edge loop exited");
}
