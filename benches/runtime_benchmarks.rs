//! Performance benchmarks for the Mercury runtime core
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Microtask queue drain throughput
//! - Timer arm/cancel churn and firing on a virtual clock
//! - Event dispatch along a deep propagation path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mercury::dom::{ListenerCallback, ListenerOptions, TreeAccess};
use mercury::event_loop::ManualClock;
use mercury::{
    Event, EventInit, EventTargetKey, NodeId, RuntimeConfig, SchedulerConfig, Task, TaskScheduler, Window,
};
use std::rc::Rc;

fn manual_scheduler() -> Rc<TaskScheduler> {
    TaskScheduler::with_clock(SchedulerConfig::default(), Rc::new(ManualClock::new()))
}

/// Benchmark: queue N microtasks and drain them in one tick
fn bench_microtask_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("microtask_drain");
    for count in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let sched = manual_scheduler();
            b.iter(|| {
                for _ in 0..count {
                    sched.queue_microtask(Task::host(|_| Ok(())));
                }
                black_box(sched.tick())
            })
        });
    }
    group.finish();
}

/// Benchmark: timer arming, cancellation and firing
fn bench_timer_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("timers");

    group.bench_function("arm_cancel_1000", |b| {
        let sched = manual_scheduler();
        b.iter(|| {
            for i in 0..1_000 {
                let id = sched.arm_host_timer(i as f64, false, |_| Ok(()));
                sched.cancel_timer(black_box(id));
            }
        })
    });

    group.bench_function("fire_1000", |b| {
        let sched = manual_scheduler();
        b.iter(|| {
            for i in 0..1_000 {
                sched.arm_host_timer((i % 50) as f64, false, |_| Ok(()));
            }
            black_box(sched.run_until_idle().ok())
        })
    });

    group.finish();
}

fn deep_tree(window: &Window, depth: usize) -> NodeId {
    let mut parent = window.document();
    for _ in 0..depth {
        let child = window.create_element("div");
        let _ = window.append_child(parent, child);
        parent = child;
    }
    parent
}

/// Benchmark: dispatch a bubbling event to the leaf of a deep tree with a
/// listener on every ancestor
fn bench_deep_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    for depth in [8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::new("deep_tree", depth), &depth, |b, &depth| {
            let window = Window::new(manual_scheduler(), RuntimeConfig::default()).unwrap();
            let leaf = deep_tree(&window, depth);
            let mut node = Some(leaf);
            while let Some(current) = node {
                window.add_event_listener(
                    EventTargetKey::Node(current),
                    "bench",
                    ListenerCallback::host(|_, _| Ok(())),
                    ListenerOptions::default(),
                );
                node = window.tree().parent_of(current);
            }
            b.iter(|| {
                let event = Rc::new(Event::new("bench", EventInit::bubbling(), window.now()));
                black_box(window.dispatch_event(EventTargetKey::Node(leaf), &event, None).ok())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_microtask_drain, bench_timer_churn, bench_deep_dispatch);
criterion_main!(benches);
