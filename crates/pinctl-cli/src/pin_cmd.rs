//! 引脚命令

use anyhow::{Context, Result};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use pinctl_core::ControllerConfig;
use pinctl_gpio::sim::SimChip;
use pinctl_gpio::{
    CancellationToken, GpioController, PinEventTypes, PinMode, PinValue, WaitForEventResult,
};

/// 打开控制器；指定模拟线路数时使用进程内模拟芯片
pub fn open_controller(config: ControllerConfig, simulate: Option<u32>) -> Result<GpioController> {
    let chip_index = config.chip_index;
    let gpio = match simulate {
        Some(lines) => {
            debug!(lines, "using simulated chip");
            GpioController::with_opener(config, &SimChip::with_index(chip_index, lines))
        }
        None => GpioController::new(config),
    }
    .with_context(|| format!("failed to open GPIO chip {}", chip_index))?;

    Ok(gpio)
}

pub fn info(gpio: &GpioController) -> Result<()> {
    println!("chip:     gpiochip{}", gpio.config().chip_index);
    println!("consumer: {}", gpio.config().consumer);
    println!("pins:     {}", gpio.pin_count());

    let open: Vec<_> = gpio
        .list_pins()
        .into_iter()
        .filter(|p| p.mode.is_some())
        .collect();
    if !open.is_empty() {
        println!("{}", serde_json::to_string_pretty(&open)?);
    }

    Ok(())
}

pub fn read(gpio: &GpioController, pin: u32) -> Result<()> {
    let value = read_value(gpio, pin)?;
    println!("{}", value.as_u8());
    Ok(())
}

pub fn write(gpio: &GpioController, pin: u32, value: PinValue) -> Result<()> {
    open_as(gpio, pin, PinMode::Output)?;
    gpio.write(pin, value)?;
    info!(pin, value = %value, "pin written");
    Ok(())
}

pub fn toggle(gpio: &GpioController, pin: u32) -> Result<()> {
    open_as(gpio, pin, PinMode::Output)?;
    let value = gpio.toggle(pin)?;
    println!("{}", value.as_u8());
    Ok(())
}

/// 等待一次边沿。Ctrl-C 或超时都会取消等待
pub async fn wait(
    gpio: GpioController,
    pin: u32,
    edge: PinEventTypes,
    timeout: Option<Duration>,
) -> Result<()> {
    let result = wait_edge(Arc::new(gpio), pin, edge, timeout, ctrl_c()).await?;

    match result {
        WaitForEventResult::Event(change) => println!("{}", describe(change)),
        WaitForEventResult::TimedOut => println!("timed out"),
    }

    Ok(())
}

async fn wait_edge(
    gpio: Arc<GpioController>,
    pin: u32,
    edge: PinEventTypes,
    timeout: Option<Duration>,
    interrupt: impl Future<Output = ()>,
) -> Result<WaitForEventResult> {
    open_as(&gpio, pin, PinMode::Input)?;

    let token = CancellationToken::new();
    let waiter = {
        let gpio = gpio.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || gpio.wait_for_event(pin, edge, &token))
    };
    tokio::pin!(waiter);

    let result = tokio::select! {
        res = &mut waiter => res,
        _ = interrupt => {
            debug!(pin, "wait interrupted");
            token.cancel();
            waiter.await
        }
        _ = deadline(timeout) => {
            debug!(pin, "wait deadline reached");
            token.cancel();
            waiter.await
        }
    };

    Ok(result.context("wait task panicked")??)
}

fn open_as(gpio: &GpioController, pin: u32, mode: PinMode) -> Result<()> {
    gpio.open_pin(pin)?;
    // 重新申请输出会把电平复位为低
    if gpio.get_pin_mode(pin)? != Some(mode) {
        gpio.set_pin_mode(pin, mode)?;
    }
    Ok(())
}

fn read_value(gpio: &GpioController, pin: u32) -> Result<PinValue> {
    open_as(gpio, pin, PinMode::Input)?;
    Ok(gpio.read(pin)?)
}

fn describe(change: PinEventTypes) -> &'static str {
    if change.contains(PinEventTypes::RISING) {
        "rising"
    } else {
        "falling"
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        future::pending::<()>().await;
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => future::pending().await,
    }
}
