//! Integration tests for task scheduling through the window's global surface

mod common;

use common::*;
use mercury::dom::{EventDetail, ListenerCallback, ListenerOptions};
use mercury::{AbortSignal, Error, EventTargetKey, Promise, RuntimeConfig, Task, Value, Window};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

mod ordering {
    use super::*;

    #[test]
    fn test_microtasks_promises_then_timers() {
        let window = manual_window();
        let sched = window.scheduler().clone();
        let global = window.global();
        let log = log();

        global
            .call_method("setTimeout", &[recorder(&log, "timeout"), Value::Number(0.0)])
            .unwrap();
        let promise = Promise::resolved(&sched, Value::Undefined);
        promise.then(&sched, Some(recorder(&log, "then")), None);
        global.call_method("queueMicrotask", &[recorder(&log, "micro")]).unwrap();
        sched.queue_macrotask(Task::callback(recorder(&log, "macro"), Vec::new()));

        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["then", "micro", "macro", "timeout"]);
    }

    #[test]
    fn test_timer_args_forwarded() {
        let window = manual_window();
        let global = window.global();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let callback = Value::new_function("cb", move |_, args| {
            sink.borrow_mut().extend(args.iter().map(Value::to_js_string));
            Ok(Value::Undefined)
        });
        global
            .call_method("setTimeout", &[callback, Value::Number(10.0), Value::from("a"), Value::from("b")])
            .unwrap();
        window.scheduler().run_until_idle().unwrap();
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_interval_cleared_from_its_callback() {
        let window = manual_window();
        let global = window.global();
        let count = Rc::new(Cell::new(0));
        let id = Rc::new(RefCell::new(Value::Undefined));

        let (counter, handle, g) = (count.clone(), id.clone(), global.clone());
        let callback = Value::new_function("tick", move |_, _| {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                g.call_method("clearInterval", &[handle.borrow().clone()])?;
            }
            Ok(Value::Undefined)
        });
        let timer = global
            .call_method("setInterval", &[callback, Value::Number(0.0)])
            .unwrap();
        *id.borrow_mut() = timer;

        let result = window.scheduler().run_until_idle().unwrap();
        assert_eq!(count.get(), 3);
        // Intervals are floored to the 4ms minimum.
        assert_eq!(result.final_time, 12);
    }

    #[test]
    fn test_timeout_signal_aborts_on_virtual_clock() {
        let (sched, clock) = manual_scheduler();
        let signal = AbortSignal::timeout(&sched, 250.0);
        clock.advance(249);
        sched.tick();
        assert!(!signal.aborted());
        sched.run_until_idle().unwrap();
        assert!(signal.aborted());
        assert_eq!(signal.reason().error_name().as_deref(), Some("TimeoutError"));
    }
}

mod error_reporting {
    use super::*;

    #[test]
    fn test_throwing_timer_reaches_window_error_event() {
        let window = manual_window();
        let global = window.global();
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = messages.clone();
        window.add_event_listener(
            EventTargetKey::Window,
            "error",
            ListenerCallback::host(move |event, _| {
                if let EventDetail::Error { message, .. } = event.detail() {
                    sink.borrow_mut().push(message.clone());
                }
                event.prevent_default();
                Ok(())
            }),
            ListenerOptions::default(),
        );

        let log = log();
        let failing = Value::new_function("failing", |_, _| Err(Error::type_error("timer exploded")));
        global.call_method("setTimeout", &[failing, Value::Number(1.0)]).unwrap();
        global.call_method("setTimeout", &[recorder(&log, "next"), Value::Number(2.0)]).unwrap();
        window.scheduler().run_until_idle().unwrap();

        assert_eq!(*log.borrow(), vec!["next"]);
        assert_eq!(messages.borrow().len(), 1);
        assert!(messages.borrow()[0].contains("timer exploded"));
    }

    #[test]
    fn test_windows_sharing_a_scheduler_keep_their_errors() {
        let (sched, _clock) = manual_scheduler();
        let a = Window::new(sched.clone(), RuntimeConfig::default()).unwrap();
        let b = Window::new(sched.clone(), RuntimeConfig::default()).unwrap();
        let log = log();
        a.global()
            .call_method("addEventListener", &[Value::from("error"), recorder(&log, "a")])
            .unwrap();
        b.global()
            .call_method("addEventListener", &[Value::from("error"), recorder(&log, "b")])
            .unwrap();

        let failing = Value::new_function("failing", |_, _| Err(Error::type_error("from a")));
        a.global().call_method("setTimeout", &[failing, Value::Number(0.0)]).unwrap();
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["a"]);

        let failing = Value::new_function("failing", |_, _| Err(Error::type_error("from b")));
        b.global().call_method("queueMicrotask", &[failing]).unwrap();
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_unhandled_rejection_event() {
        let window = manual_window();
        let sched = window.scheduler().clone();
        let reasons = Rc::new(RefCell::new(Vec::new()));
        let sink = reasons.clone();
        window.add_event_listener(
            EventTargetKey::Window,
            "unhandledrejection",
            ListenerCallback::host(move |event, _| {
                if let EventDetail::PromiseRejection { reason } = event.detail() {
                    sink.borrow_mut().push(reason.to_js_string());
                }
                Ok(())
            }),
            ListenerOptions::default(),
        );

        let _unhandled = Promise::rejected(&sched, Value::from("nobody listens"));
        let handled = Promise::rejected(&sched, Value::from("caught"));
        handled.catch(&sched, Value::new_function("catch", |_, _| Ok(Value::Undefined)));
        sched.run_until_idle().unwrap();

        assert_eq!(*reasons.borrow(), vec!["nobody listens"]);
    }
}
