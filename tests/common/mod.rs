//! Shared test helpers for integration tests

#![allow(dead_code)]

use mercury::event_loop::{ManualClock, Settlement};
use mercury::{Promise, RuntimeConfig, SchedulerConfig, TaskScheduler, Value, Window};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::thread::{self, JoinHandle};

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Script callable that appends `tag` to `log`
pub fn recorder(log: &Log, tag: &str) -> Value {
    let log = log.clone();
    let tag = tag.to_string();
    Value::new_function(&tag.clone(), move |_, _| {
        log.borrow_mut().push(tag.clone());
        Ok(Value::Undefined)
    })
}

/// Scheduler on a virtual clock, plus that clock
pub fn manual_scheduler() -> (Rc<TaskScheduler>, Rc<ManualClock>) {
    let clock = Rc::new(ManualClock::new());
    let sched = TaskScheduler::with_clock(SchedulerConfig::default(), clock.clone());
    (sched, clock)
}

/// Window on a virtual-clock scheduler
pub fn manual_window() -> Rc<Window> {
    let (sched, _clock) = manual_scheduler();
    Window::new(sched, RuntimeConfig::default()).expect("default config is valid")
}

/// Window on a real-time scheduler, for tests that do real I/O
pub fn system_window() -> Rc<Window> {
    let config = RuntimeConfig::default();
    let sched = TaskScheduler::new(config.scheduler.clone());
    Window::new(sched, config).expect("default config is valid")
}

/// Slot filled once `promise` settles
pub fn settlement_of(sched: &TaskScheduler, promise: &Promise) -> Rc<RefCell<Option<Settlement>>> {
    let slot = Rc::new(RefCell::new(None));
    let sink = slot.clone();
    promise.on_settled(sched, move |_, settlement| {
        *sink.borrow_mut() = Some(settlement);
        Ok(())
    });
    slot
}

/// Serve `response` to exactly one connection on an ephemeral port. The
/// handle yields the raw request head the server received.
pub fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let _ = stream.write_all(response.as_bytes());
        String::from_utf8_lossy(&buf).into_owned()
    });
    (format!("http://{}/", addr), handle)
}

/// Accept one connection and hold it open without answering until the
/// client hangs up
pub fn serve_silently() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut chunk = [0u8; 1024];
            while let Ok(n) = stream.read(&mut chunk) {
                if n == 0 {
                    break;
                }
            }
        }
    });
    (format!("http://{}/", addr), handle)
}
