//! 进程内模拟芯片
//!
//! 记录每次线路获取/释放、模式请求和芯片释放，并允许注入边沿、
//! 模拟外部占用和原生调用失败。

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use pinctl_core::{GpioError, Result};

use crate::native::{ChipOpener, EdgeWatch, NativeChip, NativeLine};
use crate::types::{PinEventTypes, PinValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimRequest {
    Input,
    Output,
    Edges,
}

#[derive(Default)]
struct SimLineState {
    level: Option<PinValue>,
    request: Option<SimRequest>,
    history: Vec<SimRequest>,
    consumer: Option<String>,
    external_busy: bool,
    live_handles: usize,
    acquisitions: usize,
    releases: usize,
    watch: Option<Sender<Result<PinEventTypes>>>,
    watch_releases: usize,
    fail_next_read: bool,
    fail_next_request: bool,
}

struct SimState {
    lines: Vec<SimLineState>,
    chip_opens: usize,
    chip_releases: usize,
}

/// 测试侧句柄，可克隆，所有克隆共享同一状态
#[derive(Clone)]
pub struct SimChip {
    index: u32,
    state: Arc<Mutex<SimState>>,
}

impl SimChip {
    pub fn new(num_lines: u32) -> Self {
        Self::with_index(0, num_lines)
    }

    pub fn with_index(index: u32, num_lines: u32) -> Self {
        let lines = (0..num_lines).map(|_| SimLineState::default()).collect();
        Self {
            index,
            state: Arc::new(Mutex::new(SimState {
                lines,
                chip_opens: 0,
                chip_releases: 0,
            })),
        }
    }

    pub fn num_lines(&self) -> u32 {
        self.state.lock().lines.len() as u32
    }

    /// 注入一个边沿：更新电平并投递给当前的边沿监视者
    pub fn inject_edge(&self, pin: u32, edge: PinEventTypes) -> bool {
        let mut state = self.state.lock();
        let line = &mut state.lines[pin as usize];
        line.level = Some(if edge == PinEventTypes::RISING {
            PinValue::High
        } else {
            PinValue::Low
        });
        match line.watch.as_ref() {
            Some(tx) => tx.send(Ok(edge)).is_ok(),
            None => false,
        }
    }

    pub fn set_level(&self, pin: u32, value: PinValue) {
        self.state.lock().lines[pin as usize].level = Some(value);
    }

    pub fn level(&self, pin: u32) -> PinValue {
        self.state.lock().lines[pin as usize]
            .level
            .unwrap_or(PinValue::Low)
    }

    /// 模拟其他进程占用该线路
    pub fn set_external_busy(&self, pin: u32, busy: bool) {
        self.state.lock().lines[pin as usize].external_busy = busy;
    }

    pub fn fail_next_read(&self, pin: u32) {
        self.state.lock().lines[pin as usize].fail_next_read = true;
    }

    pub fn fail_next_request(&self, pin: u32) {
        self.state.lock().lines[pin as usize].fail_next_request = true;
    }

    /// 让该线路的边沿等待返回错误，事件循环随之终止
    pub fn break_watch(&self, pin: u32) -> bool {
        let state = self.state.lock();
        match state.lines[pin as usize].watch.as_ref() {
            Some(tx) => tx
                .send(Err(sim_error("edge watch broken", pin)))
                .is_ok(),
            None => false,
        }
    }

    pub fn has_watch(&self, pin: u32) -> bool {
        self.state.lock().lines[pin as usize].watch.is_some()
    }

    pub fn request(&self, pin: u32) -> Option<SimRequest> {
        self.state.lock().lines[pin as usize].request
    }

    pub fn request_history(&self, pin: u32) -> Vec<SimRequest> {
        self.state.lock().lines[pin as usize].history.clone()
    }

    pub fn consumer(&self, pin: u32) -> Option<String> {
        self.state.lock().lines[pin as usize].consumer.clone()
    }

    pub fn line_acquisitions(&self, pin: u32) -> usize {
        self.state.lock().lines[pin as usize].acquisitions
    }

    pub fn line_releases(&self, pin: u32) -> usize {
        self.state.lock().lines[pin as usize].releases
    }

    pub fn watch_releases(&self, pin: u32) -> usize {
        self.state.lock().lines[pin as usize].watch_releases
    }

    /// 当前未释放的线路对象总数
    pub fn live_lines(&self) -> usize {
        self.state.lock().lines.iter().map(|l| l.live_handles).sum()
    }

    pub fn chip_opens(&self) -> usize {
        self.state.lock().chip_opens
    }

    pub fn chip_releases(&self) -> usize {
        self.state.lock().chip_releases
    }
}

impl ChipOpener for SimChip {
    fn open(&self, index: u32) -> Result<Box<dyn NativeChip>> {
        if index != self.index {
            return Err(GpioError::NotFound {
                chip: index,
                os_code: Some(2),
            });
        }
        self.state.lock().chip_opens += 1;
        Ok(Box::new(SimChipDevice {
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimChipDevice {
    state: Arc<Mutex<SimState>>,
}

impl NativeChip for SimChipDevice {
    fn num_lines(&self) -> u32 {
        self.state.lock().lines.len() as u32
    }

    fn get_line(&self, offset: u32) -> Result<Box<dyn NativeLine>> {
        let mut state = self.state.lock();
        let line = state
            .lines
            .get_mut(offset as usize)
            .ok_or_else(|| sim_error("no such line", offset))?;
        line.acquisitions += 1;
        line.live_handles += 1;
        Ok(Box::new(SimLine {
            offset,
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for SimChipDevice {
    fn drop(&mut self) {
        self.state.lock().chip_releases += 1;
    }
}

struct SimLine {
    offset: u32,
    state: Arc<Mutex<SimState>>,
}

impl SimLine {
    fn request(&self, kind: SimRequest, consumer: &str) -> Result<()> {
        let mut state = self.state.lock();
        let line = &mut state.lines[self.offset as usize];
        if line.fail_next_request || line.external_busy {
            line.fail_next_request = false;
            return Err(GpioError::Io {
                message: "line request failed".to_string(),
                pin: Some(self.offset),
                os_code: Some(16),
            });
        }
        line.request = Some(kind);
        line.history.push(kind);
        line.consumer = Some(consumer.to_string());
        Ok(())
    }
}

impl NativeLine for SimLine {
    fn offset(&self) -> u32 {
        self.offset
    }

    fn is_free(&self) -> Result<bool> {
        let state = self.state.lock();
        let line = &state.lines[self.offset as usize];
        Ok(line.request.is_none() && !line.external_busy)
    }

    fn request_input(&self, consumer: &str) -> Result<()> {
        self.request(SimRequest::Input, consumer)
    }

    fn request_output(&self, consumer: &str, initial: PinValue) -> Result<()> {
        self.request(SimRequest::Output, consumer)?;
        self.state.lock().lines[self.offset as usize].level = Some(initial);
        Ok(())
    }

    fn get_value(&self) -> Result<PinValue> {
        let mut state = self.state.lock();
        let line = &mut state.lines[self.offset as usize];
        if line.fail_next_read {
            line.fail_next_read = false;
            return Err(sim_error("read failed", self.offset));
        }
        if line.request.is_none() {
            return Err(sim_error("line not requested", self.offset));
        }
        Ok(line.level.unwrap_or(PinValue::Low))
    }

    fn set_value(&self, value: PinValue) -> Result<()> {
        let mut state = self.state.lock();
        let line = &mut state.lines[self.offset as usize];
        if line.request != Some(SimRequest::Output) {
            return Err(sim_error("line not requested as output", self.offset));
        }
        line.level = Some(value);
        Ok(())
    }

    fn watch_edges(&self, consumer: &str) -> Result<Box<dyn EdgeWatch>> {
        self.request(SimRequest::Edges, consumer)?;
        let (tx, rx) = channel::unbounded();
        self.state.lock().lines[self.offset as usize].watch = Some(tx);
        Ok(Box::new(SimEdgeWatch {
            offset: self.offset,
            rx,
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for SimLine {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let line = &mut state.lines[self.offset as usize];
        line.releases += 1;
        line.live_handles -= 1;
        if line.live_handles == 0 {
            line.request = None;
            line.watch = None;
        }
    }
}

struct SimEdgeWatch {
    offset: u32,
    rx: Receiver<Result<PinEventTypes>>,
    state: Arc<Mutex<SimState>>,
}

impl EdgeWatch for SimEdgeWatch {
    fn wait(&mut self, timeout: Duration) -> Result<Option<PinEventTypes>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(edge)) => Ok(Some(edge)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(sim_error("edge watch released", self.offset))
            }
        }
    }
}

impl Drop for SimEdgeWatch {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let line = &mut state.lines[self.offset as usize];
        line.watch_releases += 1;
        line.watch = None;
        if line.request == Some(SimRequest::Edges) {
            line.request = None;
        }
    }
}

fn sim_error(message: &str, pin: u32) -> GpioError {
    GpioError::Io {
        message: message.to_string(),
        pin: Some(pin),
        os_code: None,
    }
}
