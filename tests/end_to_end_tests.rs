//! End-to-end capture scenarios through the public dispatch surface

use calltrace::document::{CallNode, CallResult, TraceEntry};
use calltrace::{
    dispatch, start, stop, EventFilter, EventKind, EventPayload, ExceptionInfo, FrameRecord,
    IndexBuilder, TraceConfig, TraceDocument,
};
use serial_test::serial;
use std::sync::Arc;

fn ret(value: &str) -> EventPayload {
    EventPayload::Return(Some(value.to_string()))
}

fn run(config: TraceConfig, events: &[(EventKind, FrameRecord, EventPayload)]) -> TraceDocument {
    let filter = EventFilter::new(config);
    filter.start();
    for (kind, frame, payload) in events {
        filter.dispatch(*kind, frame, payload.clone());
    }
    filter.stop().unwrap()
}

fn names(calls: &[CallNode]) -> Vec<&str> {
    calls.iter().map(|c| c.function.as_str()).collect()
}

#[test]
fn test_excluded_file_produces_no_node() {
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    let g = FrameRecord::new(2, "g", "/proj/b.py", 1).at_depth(1);
    let config = TraceConfig::default()
        .with_include("*/a.py")
        .with_var_trace(true);

    let doc = run(
        config,
        &[
            (EventKind::Call, f.clone(), EventPayload::None),
            (EventKind::Line, f.clone().at_line(2).with_locals(&[("x", "1")]), EventPayload::None),
            (EventKind::Call, g.clone(), EventPayload::None),
            (EventKind::Return, g, ret("None")),
            (
                EventKind::Line,
                f.clone().at_line(3).with_locals(&[("x", "1"), ("y", "2")]),
                EventPayload::None,
            ),
            (EventKind::Return, f, ret("None")),
        ],
    );

    assert_eq!(names(&doc.calls), vec!["f"]);
    let root = &doc.calls[0];
    let lines: Vec<_> = root.line_events().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].variables.get("x").map(String::as_str), Some("1"));
    assert_eq!(lines[1].variables.get("y").map(String::as_str), Some("2"));
    assert!(!lines[1].variables.contains_key("x"));
    assert_eq!(root.child_calls().count(), 0);
}

#[test]
fn test_diff_correctness() {
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    let states: [&[(&str, &str)]; 3] = [&[("x", "1")], &[("x", "1"), ("y", "2")], &[("x", "1"), ("y", "2")]];
    let mut events = vec![(EventKind::Call, f.clone(), EventPayload::None)];
    for (i, locals) in states.iter().enumerate() {
        events.push((
            EventKind::Line,
            f.clone().at_line(2 + i as u32).with_locals(locals),
            EventPayload::None,
        ));
    }
    events.push((EventKind::Return, f, ret("None")));

    let doc = run(TraceConfig::default().with_var_trace(true), &events);
    let diffs: Vec<Vec<(String, String)>> = doc.calls[0]
        .line_events()
        .map(|l| l.variables.clone().into_iter().collect())
        .collect();
    assert_eq!(
        diffs,
        vec![
            vec![("x".to_string(), "1".to_string())],
            vec![("y".to_string(), "2".to_string())],
            vec![],
        ]
    );
}

#[test]
fn test_blacklisted_call_children_reparent() {
    let a = FrameRecord::new(1, "a", "/proj/m.py", 1);
    let noisy = FrameRecord::new(2, "noisy", "/proj/m.py", 10).at_depth(1);
    let c = FrameRecord::new(3, "c", "/proj/m.py", 20).at_depth(2);

    let doc = run(
        TraceConfig::default().with_excluded_function("noisy"),
        &[
            (EventKind::Call, a.clone(), EventPayload::None),
            (EventKind::Call, noisy.clone(), EventPayload::None),
            (EventKind::Line, noisy.clone().at_line(11), EventPayload::None),
            (EventKind::Call, c.clone(), EventPayload::None),
            (EventKind::Return, c, ret("3")),
            (EventKind::Return, noisy, ret("2")),
            (EventKind::Return, a, ret("1")),
        ],
    );

    let root = &doc.calls[0];
    let children: Vec<_> = root.child_calls().collect();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].function, "c");
    assert_eq!(root.line_events().count(), 0);
}

#[test]
fn test_deferred_activation_depth() {
    let main = FrameRecord::new(1, "main", "/proj/file.py", 1).at_depth(2);
    let setup = FrameRecord::new(2, "setup", "/proj/file.py", 5).at_depth(3);
    let work = FrameRecord::new(3, "work", "/proj/file.py", 40).at_depth(3);

    let doc = run(
        TraceConfig::default().with_start_trigger("file.py", 20),
        &[
            (EventKind::Call, main.clone(), EventPayload::None),
            (EventKind::Call, setup.clone(), EventPayload::None),
            (EventKind::Return, setup, ret("None")),
            (EventKind::Line, main.clone().at_line(19), EventPayload::None),
            (EventKind::Line, main.clone().at_line(20), EventPayload::None),
            (EventKind::Call, work.clone(), EventPayload::None),
            (EventKind::Line, work.clone().at_line(41), EventPayload::None),
            (EventKind::Return, work, ret("None")),
            (EventKind::Return, main, ret("None")),
        ],
    );

    assert_eq!(names(&doc.calls), vec!["work"]);
    assert_eq!(doc.calls[0].depth, 3);
    assert_eq!(doc.calls[0].line_events().count(), 1);
}

#[test]
fn test_deferred_activation_depth_through_filtered_frame() {
    let main = FrameRecord::new(1, "main", "/app/main.py", 1).at_depth(3);
    let vendor = FrameRecord::new(2, "helper", "/lib/vendor.py", 7).at_depth(4);
    let work = FrameRecord::new(3, "work", "/app/work.py", 1).at_depth(5);

    let doc = run(
        TraceConfig::default()
            .with_include("/app/*")
            .with_start_trigger("main.py", 20),
        &[
            (EventKind::Call, main.clone(), EventPayload::None),
            (EventKind::Line, main.clone().at_line(20), EventPayload::None),
            (EventKind::Call, vendor.clone(), EventPayload::None),
            (EventKind::Call, work.clone(), EventPayload::None),
            (EventKind::Return, work, ret("None")),
            (EventKind::Return, vendor, ret("None")),
            (EventKind::Return, main, ret("None")),
        ],
    );

    assert_eq!(names(&doc.calls), vec!["work"]);
    assert_eq!(doc.calls[0].depth, 5);
}

#[test]
fn test_exception_handled_on_empty_chain_regression() {
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    let mut events = vec![(EventKind::Call, f.clone(), EventPayload::None)];
    for _ in 0..5 {
        events.push((EventKind::ExceptionHandled, f.clone(), EventPayload::None));
    }
    events.push((
        EventKind::Exception,
        f.clone().at_line(3),
        EventPayload::Exception(ExceptionInfo::new("RuntimeError", "boom")),
    ));
    events.push((EventKind::ExceptionHandled, f.clone(), EventPayload::None));
    events.push((EventKind::Line, f.clone().at_line(4), EventPayload::None));
    events.push((EventKind::Return, f, ret("0")));

    let doc = run(TraceConfig::default(), &events);
    assert_eq!(doc.error_count, 0);
    let root = &doc.calls[0];
    assert_eq!(root.result, CallResult::Returned { value: "0".to_string() });
    let exc = root.exceptions().next().unwrap();
    assert_eq!(exc.type_name, "RuntimeError");
    assert_eq!(exc.chain_position, 0);
    assert_eq!(root.line_events().count(), 1);
}

#[test]
fn test_exception_propagates_through_frames() {
    let outer = FrameRecord::new(1, "outer", "/proj/a.py", 1);
    let inner = FrameRecord::new(2, "inner", "/proj/a.py", 10).at_depth(1);
    let err = || EventPayload::Exception(ExceptionInfo::new("KeyError", "'k'"));

    let doc = run(
        TraceConfig::default(),
        &[
            (EventKind::Call, outer.clone(), EventPayload::None),
            (EventKind::Call, inner.clone(), EventPayload::None),
            (EventKind::Exception, inner.clone().at_line(12), err()),
            (EventKind::Return, inner, EventPayload::Return(None)),
            (EventKind::Exception, outer.clone().at_line(3), err()),
            (EventKind::ExceptionHandled, outer.clone(), EventPayload::None),
            (EventKind::Return, outer, ret("None")),
        ],
    );

    let root = &doc.calls[0];
    let inner_node = root.child_calls().next().unwrap();
    assert_eq!(inner_node.result, CallResult::Unwound);
    assert_eq!(inner_node.exceptions().next().unwrap().chain_position, 0);
    assert_eq!(root.exceptions().next().unwrap().chain_position, 1);
}

#[test]
fn test_stop_closes_open_calls() {
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    let g = FrameRecord::new(2, "g", "/proj/a.py", 5).at_depth(1);
    let doc = run(
        TraceConfig::default(),
        &[
            (EventKind::Call, f, EventPayload::None),
            (EventKind::Call, g, EventPayload::None),
        ],
    );
    let root = &doc.calls[0];
    assert_eq!(root.result, CallResult::NotReturned);
    assert_eq!(root.child_calls().next().unwrap().result, CallResult::NotReturned);
    assert_eq!(root.subtree_size, 2);
}

#[test]
fn test_subtree_sizes_and_index() {
    let a = FrameRecord::new(1, "A", "/proj/a.py", 1);
    let b = FrameRecord::new(2, "B", "/proj/a.py", 5).at_depth(1);
    let c = FrameRecord::new(3, "C", "/proj/c.py", 9).at_depth(1);
    let d = FrameRecord::new(4, "D", "/proj/c.py", 20).at_depth(2);

    let doc = run(
        TraceConfig::default(),
        &[
            (EventKind::Call, a.clone(), EventPayload::None),
            (EventKind::Call, b.clone(), EventPayload::None),
            (EventKind::Return, b, ret("None")),
            (EventKind::Call, c.clone(), EventPayload::None),
            (EventKind::Call, d.clone(), EventPayload::None),
            (EventKind::Return, d, ret("None")),
            (EventKind::Return, c, ret("None")),
            (EventKind::Return, a, ret("None")),
        ],
    );

    let root = &doc.calls[0];
    assert_eq!(root.subtree_size, 4);
    let sizes: Vec<_> = root.child_calls().map(|c| c.subtree_size).collect();
    assert_eq!(sizes, vec![1, 2]);

    let index = IndexBuilder::build(&doc);
    assert_eq!(index.by_function("D"), &[vec![0, 1, 0]]);
    assert_eq!(index.by_file("/proj/c.py").len(), 2);
    assert_eq!(index.by_file("c.py").len(), 2);
    assert_eq!(index.by_location("/proj/c.py", 9), &[vec![0, 1]]);
    assert_eq!(doc.call_at(&[0, 1, 0]).unwrap().function, "D");
}

#[test]
fn test_concurrent_threads_keep_separate_trees() {
    let filter = EventFilter::new(TraceConfig::default().with_var_trace(true));
    filter.start();

    std::thread::scope(|scope| {
        for thread in 0..4u64 {
            let filter = &filter;
            scope.spawn(move || {
                for call in 0..25u64 {
                    let id = thread * 1000 + call * 2;
                    let outer = FrameRecord::new(id, "outer", "/proj/w.py", 1).on_thread(thread);
                    let inner = FrameRecord::new(id + 1, "inner", "/proj/w.py", 10)
                        .on_thread(thread)
                        .at_depth(1);
                    assert!(filter.on_call(&outer));
                    filter.on_line(&outer.clone().at_line(2).with_local("i", &call.to_string()));
                    assert!(filter.on_call(&inner));
                    filter.on_line(&inner.clone().at_line(11));
                    filter.on_return(&inner, Some("1".to_string()));
                    filter.on_return(&outer, Some("2".to_string()));
                }
            });
        }
    });

    assert_eq!(filter.active_frames(), 0);
    let doc = filter.stop().unwrap();
    assert_eq!(doc.error_count, 0);
    assert_eq!(doc.calls.len(), 100);
    for root in &doc.calls {
        assert_eq!(root.function, "outer");
        assert_eq!(root.depth, 0);
        let children: Vec<_> = root.child_calls().collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].thread, root.thread);
        assert_eq!(children[0].depth, 1);
        assert_eq!(root.subtree_size, 4);
    }
    for thread in 0..4u64 {
        let count = doc.calls.iter().filter(|c| c.thread.0 == thread).count();
        assert_eq!(count, 25);
    }
}

#[test]
fn test_system_paths_and_self_paths_rejected() {
    let config = TraceConfig::default()
        .with_system_root("/usr/lib/python3.12")
        .with_stdlib("json")
        .with_self_path("/opt/calltrace");
    let filter = EventFilter::new(config);
    filter.start();

    let stdlib = FrameRecord::new(1, "loads", "/usr/lib/python3.12/json/__init__.py", 1);
    let other = FrameRecord::new(2, "get", "/usr/lib/python3.12/http/client.py", 1);
    let own = FrameRecord::new(3, "hook", "/opt/calltrace/hook.py", 1);
    let synthetic = FrameRecord::new(4, "<module>", "<string>", 1);

    assert!(filter.on_call(&stdlib));
    assert!(!filter.on_call(&other));
    assert!(!filter.on_call(&own));
    assert!(!filter.on_call(&synthetic));
    filter.on_return(&stdlib, Some("{}".to_string()));

    let doc = filter.stop().unwrap();
    assert_eq!(names(&doc.calls), vec!["loads"]);
    assert_eq!(doc.calls[0].display_file, "json/__init__.py");
}

#[test]
fn test_long_values_are_truncated() {
    let long = "x".repeat(1000);
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1).with_argument("data", &long);
    let doc = run(
        TraceConfig::default().with_var_trace(true),
        &[
            (EventKind::Call, f.clone(), EventPayload::None),
            (EventKind::Line, f.clone().at_line(2).with_local("s", &long), EventPayload::None),
            (EventKind::Return, f, EventPayload::Return(Some(long.clone()))),
        ],
    );
    let root = &doc.calls[0];
    assert!(root.arguments["data"].contains("omitted: 744"));
    let line = root.line_events().next().unwrap();
    assert!(line.variables["s"].len() < 400);
    match &root.result {
        CallResult::Returned { value } => assert!(value.contains("total length: 1000")),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(matches!(root.children[0], TraceEntry::Line(_)));
}

#[test]
#[serial]
fn test_session_surface() {
    let handle = start(TraceConfig::default());
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    assert!(dispatch(EventKind::Call, &f, EventPayload::None));
    dispatch(EventKind::Return, &f, ret("None"));

    let doc = stop(&handle).unwrap();
    assert!(doc.is_finalized());
    assert!(stop(&handle).is_none());
    assert!(Arc::ptr_eq(&doc, &handle.document().unwrap()));

    // No session installed: events are ignored
    assert!(!dispatch(EventKind::Call, &f, EventPayload::None));
}

#[test]
#[serial]
fn test_session_replacement_finalizes_previous() {
    let first = start(TraceConfig::default());
    let f = FrameRecord::new(1, "f", "/proj/a.py", 1);
    dispatch(EventKind::Call, &f, EventPayload::None);

    let second = start(TraceConfig::default());
    let doc = first.document().unwrap();
    assert_eq!(doc.calls[0].result, CallResult::NotReturned);

    // New session starts empty
    dispatch(EventKind::Return, &f, ret("None"));
    let doc = stop(&second).unwrap();
    assert!(doc.calls.is_empty());
}
