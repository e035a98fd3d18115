use carapace::hooks::{HookManager, ToolInvocation};
use carapace::observability::{Run, ToolEvent};
use serde_json::Map;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn concurrent_appends_are_never_lost_or_duplicated() {
    const WRITERS: usize = 16;
    const EVENTS_PER_WRITER: usize = 50;

    let run = Arc::new(Run::new("task-concurrent"));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let run = run.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..EVENTS_PER_WRITER {
                    run.append_tool_event(ToolEvent {
                        tool: format!("writer-{w}"),
                        iteration: i as u32,
                        is_error: i == 0,
                        ..ToolEvent::default()
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let (events, error_count) = run.snapshot();
    assert_eq!(events.len(), WRITERS * EVENTS_PER_WRITER);
    assert_eq!(error_count, WRITERS as u32);

    // Per-writer append order is preserved even under interleaving.
    for w in 0..WRITERS {
        let iterations: Vec<u32> = events
            .iter()
            .filter(|e| e.tool == format!("writer-{w}"))
            .map(|e| e.iteration)
            .collect();
        let expected: Vec<u32> = (0..EVENTS_PER_WRITER as u32).collect();
        assert_eq!(iterations, expected);
    }
}

#[test]
fn registration_and_dispatch_do_not_deadlock_across_threads() {
    const DISPATCHERS: usize = 8;

    let manager = Arc::new(HookManager::new());
    let barrier = Arc::new(Barrier::new(DISPATCHERS + 1));

    let dispatchers: Vec<_> = (0..DISPATCHERS)
        .map(|_| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    let inv = ToolInvocation::new("noop", Map::new());
                    manager.run_before_tool(inv).expect("pass-through hooks");
                }
            })
        })
        .collect();

    let registrar = {
        let manager = manager.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..50 {
                manager.register_before_tool(|inv| Ok(inv));
            }
        })
    };

    for handle in dispatchers {
        handle.join().expect("dispatcher thread");
    }
    registrar.join().expect("registrar thread");

    // Everything registered mid-flight is visible to later dispatches.
    let inv = ToolInvocation::new("noop", Map::new());
    assert!(manager.run_before_tool(inv).is_ok());
}
