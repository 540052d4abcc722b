use crossbeam::channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pinctl_gpio::sim::{SimChip, SimRequest};
use pinctl_gpio::{
    CancellationToken, ControllerConfig, GpioController, GpioError, ListenerId, PinEventTypes,
    PinMode, PinValue, WaitForEventResult,
};

fn controller(lines: u32) -> (SimChip, GpioController) {
    let sim = SimChip::new(lines);
    let config = ControllerConfig::new(0)
        .with_consumer("integration")
        .with_edge_wait_timeout(Duration::from_millis(10));
    let gpio = GpioController::with_opener(config, &sim).unwrap();
    (sim, gpio)
}

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// 持续注入边沿直到 stop 被置位，避开监听者注册与注入之间的竞争
fn keep_injecting(sim: SimChip, pin: u32, edge: PinEventTypes, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Acquire) {
            sim.inject_edge(pin, edge);
            thread::sleep(Duration::from_millis(3));
        }
    })
}

#[test]
fn test_chip_open_failure() {
    let sim = SimChip::with_index(3, 8);
    let result = GpioController::with_opener(ControllerConfig::new(0), &sim);
    assert!(matches!(result, Err(GpioError::NotFound { chip: 0, .. })));
}

#[test]
fn test_pin_count() {
    let (_sim, gpio) = controller(27);
    assert_eq!(gpio.pin_count(), 27);
}

#[test]
fn test_unopened_pin_operations_fail() {
    let (_sim, gpio) = controller(8);

    assert!(matches!(gpio.read(3), Err(GpioError::InvalidOperation(_))));
    assert!(matches!(
        gpio.write(3, PinValue::High),
        Err(GpioError::InvalidOperation(_))
    ));
    assert!(matches!(gpio.get_pin_mode(3), Err(GpioError::InvalidOperation(_))));
    assert!(matches!(
        gpio.set_pin_mode(3, PinMode::Output),
        Err(GpioError::InvalidOperation(_))
    ));
}

#[test]
fn test_open_pin_is_idempotent() {
    let (sim, gpio) = controller(8);

    gpio.open_pin(5).unwrap();
    gpio.open_pin(5).unwrap();

    assert!(gpio.is_pin_open(5));
    assert_eq!(sim.line_acquisitions(5), 1);
    assert_eq!(gpio.get_pin_mode(5).unwrap(), None);
}

#[test]
fn test_mode_read_write() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(1).unwrap();

    gpio.set_pin_mode(1, PinMode::Output).unwrap();
    assert_eq!(gpio.get_pin_mode(1).unwrap(), Some(PinMode::Output));
    assert_eq!(sim.request(1), Some(SimRequest::Output));

    gpio.write(1, PinValue::High).unwrap();
    assert_eq!(sim.level(1), PinValue::High);
    assert_eq!(gpio.read(1).unwrap(), PinValue::High);

    assert_eq!(gpio.toggle(1).unwrap(), PinValue::Low);
    assert_eq!(sim.level(1), PinValue::Low);

    gpio.set_pin_mode(1, PinMode::Input).unwrap();
    sim.set_level(1, PinValue::High);
    assert_eq!(gpio.read(1).unwrap(), PinValue::High);
    assert_eq!(
        sim.request_history(1),
        vec![SimRequest::Output, SimRequest::Input]
    );
}

#[test]
fn test_native_failures_surface_as_io() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(4).unwrap();

    sim.fail_next_request(4);
    let err = gpio.set_pin_mode(4, PinMode::Input).unwrap_err();
    assert!(matches!(err, GpioError::Io { pin: Some(4), .. }));
    assert_eq!(err.os_code(), Some(16));
    assert_eq!(gpio.get_pin_mode(4).unwrap(), None);

    gpio.set_pin_mode(4, PinMode::Input).unwrap();
    sim.fail_next_read(4);
    assert!(matches!(gpio.read(4), Err(GpioError::Io { .. })));
    assert!(gpio.read(4).is_ok());
}

#[test]
fn test_pin_mode_support() {
    assert!(GpioController::is_pin_mode_supported(PinMode::Input));
    assert!(GpioController::is_pin_mode_supported(PinMode::Output));
    assert!(!GpioController::is_pin_mode_supported(PinMode::InputPullUp));
    assert!(!GpioController::is_pin_mode_supported(PinMode::InputPullDown));

    let (_sim, gpio) = controller(2);
    gpio.open_pin(0).unwrap();
    assert!(matches!(
        gpio.set_pin_mode(0, PinMode::InputPullUp),
        Err(GpioError::Unsupported(_))
    ));
}

#[test]
fn test_logical_numbering_unsupported() {
    let (_sim, gpio) = controller(2);
    assert!(matches!(
        gpio.convert_pin_number_to_logical_numbering_scheme(1),
        Err(GpioError::Unsupported(_))
    ));
}

#[test]
fn test_empty_event_types_rejected() {
    let (_sim, gpio) = controller(8);
    let token = CancellationToken::new();

    // 引脚未打开时同样先报参数错误
    assert!(matches!(
        gpio.add_callback(2, PinEventTypes::empty(), |_| {}),
        Err(GpioError::InvalidArgument(_))
    ));
    assert!(matches!(
        gpio.wait_for_event(2, PinEventTypes::empty(), &token),
        Err(GpioError::InvalidArgument(_))
    ));

    gpio.open_pin(2).unwrap();
    assert!(matches!(
        gpio.add_callback(2, PinEventTypes::empty(), |_| {}),
        Err(GpioError::InvalidArgument(_))
    ));
    assert!(!gpio.is_listening(2));
}

#[test]
fn test_add_callback_requires_open_pin() {
    let (_sim, gpio) = controller(8);
    assert!(matches!(
        gpio.add_callback(6, PinEventTypes::RISING, |_| {}),
        Err(GpioError::InvalidOperation(_))
    ));
    assert!(!gpio.is_listening(6));
}

#[test]
fn test_close_pin_with_listener_is_noop() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(3).unwrap();
    gpio.add_callback(3, PinEventTypes::BOTH, |_| {}).unwrap();

    sim.set_level(3, PinValue::High);
    gpio.close_pin(3).unwrap();

    assert!(gpio.is_pin_open(3));
    assert_eq!(gpio.read(3).unwrap(), PinValue::High);
    assert_eq!(sim.line_releases(3), 0);
}

#[test]
fn test_close_pin_releases_line() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(3).unwrap();
    gpio.close_pin(3).unwrap();
    gpio.close_pin(3).unwrap();

    assert!(!gpio.is_pin_open(3));
    assert_eq!(sim.line_releases(3), 1);
    assert!(matches!(gpio.read(3), Err(GpioError::InvalidOperation(_))));
}

#[test]
fn test_remove_last_callback_destroys_handler() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(0).unwrap();

    let id = gpio.add_callback(0, PinEventTypes::RISING, |_| {}).unwrap();
    assert!(gpio.is_listening(0));
    assert!(sim.has_watch(0));

    gpio.remove_callback(0, id).unwrap();
    assert!(!gpio.is_listening(0));
    assert!(!sim.has_watch(0));
    assert_eq!(sim.watch_releases(0), 1);

    assert!(matches!(
        gpio.remove_callback(0, id),
        Err(GpioError::InvalidOperation(_))
    ));

    // 处理器销毁后线路仍由控制器持有
    assert!(gpio.is_pin_open(0));
}

#[test]
fn test_complementary_listeners_share_one_handler() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(7).unwrap();

    let (a_tx, a_rx) = channel::unbounded();
    let (b_tx, b_rx) = channel::unbounded();

    let a = gpio
        .add_callback(7, PinEventTypes::RISING, move |e| {
            a_tx.send(e.change).unwrap();
        })
        .unwrap();
    gpio.add_callback(7, PinEventTypes::FALLING, move |e| {
        assert_eq!(e.pin, 7);
        b_tx.send(e.change).unwrap();
    })
    .unwrap();

    sim.inject_edge(7, PinEventTypes::RISING);
    sim.inject_edge(7, PinEventTypes::FALLING);

    let timeout = Duration::from_secs(2);
    assert_eq!(a_rx.recv_timeout(timeout).unwrap(), PinEventTypes::RISING);
    assert_eq!(b_rx.recv_timeout(timeout).unwrap(), PinEventTypes::FALLING);

    gpio.remove_callback(7, a).unwrap();
    assert!(gpio.is_listening(7));

    sim.inject_edge(7, PinEventTypes::RISING);
    sim.inject_edge(7, PinEventTypes::FALLING);
    assert_eq!(b_rx.recv_timeout(timeout).unwrap(), PinEventTypes::FALLING);

    assert!(a_rx.try_recv().is_err());
    assert!(b_rx.try_recv().is_err());

    let watches = sim
        .request_history(7)
        .into_iter()
        .filter(|r| *r == SimRequest::Edges)
        .count();
    assert_eq!(watches, 1);
}

#[test]
fn test_wait_cancelled_before_edge() {
    let (_sim, gpio) = controller(8);
    gpio.open_pin(2).unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        })
    };

    let started = Instant::now();
    let result = gpio.wait_for_event(2, PinEventTypes::BOTH, &token).unwrap();
    canceller.join().unwrap();

    assert_eq!(result, WaitForEventResult::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(2));
    // 临时回调总会被移除
    assert!(!gpio.is_listening(2));
}

#[test]
fn test_wait_with_cancelled_token_returns_immediately() {
    let (_sim, gpio) = controller(8);
    gpio.open_pin(2).unwrap();

    let token = CancellationToken::new();
    token.cancel();

    let result = gpio.wait_for_event(2, PinEventTypes::RISING, &token).unwrap();
    assert!(result.timed_out());
    assert!(!gpio.is_listening(2));
}

#[test]
fn test_wait_reports_injected_edge() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(4).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let injector = keep_injecting(sim.clone(), 4, PinEventTypes::RISING, stop.clone());

    let result = gpio
        .wait_for_event_timeout(4, PinEventTypes::RISING | PinEventTypes::FALLING, Duration::from_secs(5))
        .unwrap();
    stop.store(true, Ordering::Release);
    injector.join().unwrap();

    assert_eq!(result, WaitForEventResult::Event(PinEventTypes::RISING));
    assert!(!gpio.is_listening(4));
}

#[test]
fn test_wait_ignores_unrequested_edge() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(4).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let injector = keep_injecting(sim.clone(), 4, PinEventTypes::FALLING, stop.clone());

    let result = gpio
        .wait_for_event_timeout(4, PinEventTypes::RISING, Duration::from_millis(80))
        .unwrap();
    stop.store(true, Ordering::Release);
    injector.join().unwrap();

    assert_eq!(result, WaitForEventResult::TimedOut);
}

#[test]
fn test_wait_ends_when_handler_torn_down() {
    let (_sim, gpio) = controller(8);
    let gpio = Arc::new(gpio);
    gpio.open_pin(6).unwrap();

    let waiter = {
        let gpio = Arc::clone(&gpio);
        thread::spawn(move || {
            let token = CancellationToken::new();
            gpio.wait_for_event(6, PinEventTypes::BOTH, &token)
        })
    };

    assert!(eventually(Duration::from_secs(2), || gpio.is_listening(6)));
    gpio.dispose();

    let result = waiter.join().unwrap().unwrap();
    assert_eq!(result, WaitForEventResult::TimedOut);
}

#[test]
fn test_dispose_releases_everything_once() {
    let (sim, gpio) = controller(8);
    for pin in [0, 1, 2] {
        gpio.open_pin(pin).unwrap();
    }
    gpio.add_callback(1, PinEventTypes::FALLING, |_| {}).unwrap();

    gpio.dispose();
    gpio.dispose();

    for pin in [0, 1, 2] {
        assert_eq!(sim.line_releases(pin), 1);
    }
    assert_eq!(sim.watch_releases(1), 1);
    assert_eq!(sim.live_lines(), 0);
    assert_eq!(sim.chip_releases(), 1);

    assert!(!gpio.is_listening(1));
    assert!(matches!(gpio.open_pin(0), Err(GpioError::InvalidOperation(_))));

    drop(gpio);
    assert_eq!(sim.chip_releases(), 1);
}

#[test]
fn test_drop_disposes() {
    let (sim, gpio) = controller(4);
    gpio.open_pin(0).unwrap();
    drop(gpio);

    assert_eq!(sim.line_releases(0), 1);
    assert_eq!(sim.chip_releases(), 1);
}

#[test]
fn test_requested_line_is_replaced_for_edge_watch() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(5).unwrap();
    gpio.set_pin_mode(5, PinMode::Input).unwrap();

    gpio.add_callback(5, PinEventTypes::RISING, |_| {}).unwrap();

    assert_eq!(sim.line_acquisitions(5), 2);
    assert_eq!(sim.line_releases(5), 1);
    assert_eq!(gpio.get_pin_mode(5).unwrap(), Some(PinMode::Input));
    assert_eq!(sim.request(5), Some(SimRequest::Edges));
}

#[test]
fn test_externally_busy_line_fails_to_watch() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(5).unwrap();
    sim.set_external_busy(5, true);

    let err = gpio.add_callback(5, PinEventTypes::RISING, |_| {}).unwrap_err();
    assert!(matches!(err, GpioError::Io { .. }));
    assert!(!gpio.is_listening(5));
    assert!(gpio.is_pin_open(5));
}

#[test]
fn test_terminated_handler_is_replaced_and_keeps_listeners() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(2).unwrap();

    let (a_tx, a_rx) = channel::unbounded();
    gpio.add_callback(2, PinEventTypes::RISING, move |e| {
        a_tx.send(e.change).unwrap();
    })
    .unwrap();

    assert!(sim.break_watch(2));
    assert!(eventually(Duration::from_secs(2), || !sim.has_watch(2)));
    // 循环退出后处理器仍保留在映射中
    assert!(gpio.is_listening(2));

    let (b_tx, b_rx) = channel::unbounded();
    gpio.add_callback(2, PinEventTypes::RISING, move |e| {
        b_tx.send(e.change).unwrap();
    })
    .unwrap();
    assert!(sim.has_watch(2));

    sim.inject_edge(2, PinEventTypes::RISING);
    let timeout = Duration::from_secs(2);
    assert_eq!(a_rx.recv_timeout(timeout).unwrap(), PinEventTypes::RISING);
    assert_eq!(b_rx.recv_timeout(timeout).unwrap(), PinEventTypes::RISING);
}

#[test]
fn test_wait_ends_when_edge_loop_fails() {
    let (sim, gpio) = controller(8);
    let gpio = Arc::new(gpio);
    gpio.open_pin(1).unwrap();

    let waiter = {
        let gpio = Arc::clone(&gpio);
        thread::spawn(move || {
            gpio.wait_for_event(1, PinEventTypes::RISING, &CancellationToken::new())
        })
    };

    assert!(eventually(Duration::from_secs(2), || sim.has_watch(1)));
    // 确保等待者的临时回调已注册
    thread::sleep(Duration::from_millis(20));
    sim.break_watch(1);

    let result = waiter.join().unwrap().unwrap();
    assert_eq!(result, WaitForEventResult::TimedOut);
}

#[test]
fn test_callback_can_remove_itself() {
    let (sim, gpio) = controller(8);
    let gpio = Arc::new(gpio);
    gpio.open_pin(3).unwrap();

    gpio.set_pin_mode(3, PinMode::Input).unwrap();

    let own_id: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
    let (tx, rx) = channel::unbounded();
    let id = {
        let weak: Weak<GpioController> = Arc::downgrade(&gpio);
        let own_id = Arc::clone(&own_id);
        gpio.add_callback(3, PinEventTypes::RISING, move |e| {
            if let (Some(gpio), Some(id)) = (weak.upgrade(), own_id.get()) {
                tx.send(gpio.remove_callback(e.pin, *id).is_ok()).unwrap();
            }
        })
        .unwrap()
    };
    own_id.set(id).unwrap();

    sim.inject_edge(3, PinEventTypes::RISING);
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    assert!(eventually(Duration::from_secs(2), || !sim.has_watch(3)));
    assert!(!gpio.is_listening(3));

    // 回调线程内销毁处理器后线路仍可读
    assert_eq!(sim.request(3), Some(SimRequest::Input));
    assert!(gpio.read(3).is_ok());
}

#[test]
fn test_pin_info() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(0).unwrap();
    gpio.open_pin(6).unwrap();
    gpio.set_pin_mode(6, PinMode::Output).unwrap();
    gpio.write(6, PinValue::High).unwrap();
    assert_eq!(sim.level(6), PinValue::High);

    let pins = gpio.list_pins();
    assert_eq!(pins.len(), 2);
    assert_eq!(pins[0].number, 0);
    assert_eq!(pins[0].mode, None);
    assert_eq!(pins[0].value, None);
    assert_eq!(pins[1].mode, Some(PinMode::Output));
    assert_eq!(pins[1].value, Some(PinValue::High));
    assert!(!pins[1].listening);
}

#[test]
fn test_concurrent_open_close_disjoint_pins() {
    const THREADS: u32 = 8;
    const PINS_PER_THREAD: u32 = 16;
    const ROUNDS: usize = 25;

    let (sim, gpio) = controller(THREADS * PINS_PER_THREAD);
    let gpio = Arc::new(gpio);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let gpio = Arc::clone(&gpio);
            thread::spawn(move || {
                let pins: Vec<u32> = (0..PINS_PER_THREAD).map(|i| t * PINS_PER_THREAD + i).collect();
                for _ in 0..ROUNDS {
                    for &pin in &pins {
                        gpio.open_pin(pin).unwrap();
                        gpio.open_pin(pin).unwrap();
                        assert!(gpio.is_pin_open(pin));
                    }
                    for &pin in &pins {
                        gpio.close_pin(pin).unwrap();
                        assert!(!gpio.is_pin_open(pin));
                    }
                }
                for &pin in &pins {
                    gpio.open_pin(pin).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    for pin in 0..THREADS * PINS_PER_THREAD {
        assert!(gpio.is_pin_open(pin));
        assert_eq!(sim.line_acquisitions(pin), ROUNDS + 1);
        assert_eq!(sim.line_releases(pin), ROUNDS);
    }
    assert_eq!(sim.live_lines(), (THREADS * PINS_PER_THREAD) as usize);
    assert_eq!(gpio.list_pins().len(), (THREADS * PINS_PER_THREAD) as usize);
}

#[test]
fn test_input_pin_stays_readable_after_wait() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(1).unwrap();
    gpio.set_pin_mode(1, PinMode::Input).unwrap();
    sim.set_level(1, PinValue::High);
    assert_eq!(gpio.read(1).unwrap(), PinValue::High);

    let result = gpio
        .wait_for_event_timeout(1, PinEventTypes::BOTH, Duration::from_millis(20))
        .unwrap();
    assert_eq!(result, WaitForEventResult::TimedOut);

    assert_eq!(gpio.get_pin_mode(1).unwrap(), Some(PinMode::Input));
    assert_eq!(sim.request(1), Some(SimRequest::Input));
    assert_eq!(gpio.read(1).unwrap(), PinValue::High);
}

#[test]
fn test_output_pin_writable_after_last_callback_removed() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(2).unwrap();
    gpio.set_pin_mode(2, PinMode::Output).unwrap();

    let id = gpio.add_callback(2, PinEventTypes::RISING, |_| {}).unwrap();
    assert_eq!(sim.request(2), Some(SimRequest::Edges));
    gpio.remove_callback(2, id).unwrap();

    assert_eq!(sim.request(2), Some(SimRequest::Output));
    assert_eq!(sim.consumer(2).as_deref(), Some("integration"));
    gpio.write(2, PinValue::High).unwrap();
    assert_eq!(gpio.read(2).unwrap(), PinValue::High);
}

#[test]
fn test_pin_without_mode_is_left_unrequested_after_wait() {
    let (sim, gpio) = controller(8);
    gpio.open_pin(4).unwrap();

    gpio.wait_for_event_timeout(4, PinEventTypes::RISING, Duration::from_millis(10))
        .unwrap();

    assert_eq!(sim.request(4), None);
    assert_eq!(gpio.get_pin_mode(4).unwrap(), None);
}

#[test]
fn test_subscribe_races_with_last_listener_removal() {
    let sim = SimChip::new(2);
    let config = ControllerConfig::new(0)
        .with_consumer("integration")
        .with_edge_wait_timeout(Duration::from_millis(1));
    let gpio = Arc::new(GpioController::with_opener(config, &sim).unwrap());
    gpio.open_pin(0).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let churn = {
        let gpio = Arc::clone(&gpio);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let id = gpio.add_callback(0, PinEventTypes::RISING, |_| {}).unwrap();
                gpio.remove_callback(0, id).unwrap();
            }
        })
    };

    for _ in 0..500 {
        let id = gpio.add_callback(0, PinEventTypes::FALLING, |_| {}).unwrap();
        // 注册成功的监听者必须挂在槽位中的处理器上
        assert!(gpio.is_listening(0));
        gpio.remove_callback(0, id).unwrap();
    }

    stop.store(true, Ordering::Release);
    churn.join().unwrap();

    assert!(!gpio.is_listening(0));
    assert!(!sim.has_watch(0));
}

#[test]
fn test_dispose_races_with_add_callback() {
    const ADDERS: usize = 4;

    for _ in 0..20 {
        let (sim, gpio) = controller(8);
        let gpio = Arc::new(gpio);
        for pin in 0..8 {
            gpio.open_pin(pin).unwrap();
        }

        let barrier = Arc::new(Barrier::new(ADDERS + 1));
        let adders: Vec<_> = (0..ADDERS as u32)
            .map(|t| {
                let gpio = Arc::clone(&gpio);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..50u32 {
                        let pin = (t * 2 + round) % 8;
                        if gpio.add_callback(pin, PinEventTypes::BOTH, |_| {}).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        gpio.dispose();
        for adder in adders {
            adder.join().unwrap();
        }

        for pin in 0..8 {
            assert!(!gpio.is_listening(pin));
            assert!(!sim.has_watch(pin));
        }
        assert_eq!(sim.live_lines(), 0);
        assert_eq!(sim.chip_releases(), 1);
    }
}
