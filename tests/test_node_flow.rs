//! End-to-end tests for node scheduling
//!
//! Nodes run on the global worker pool; every wait is bounded so a broken
//! scheduler fails the test instead of hanging it.

use nodeflow::{FlowError, Node, NodeEvent, BufferingEventSink};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Adding two constants yields their sum
#[test]
fn test_add_two_constants() {
    init_tracing();
    let add = Node::new(|x: i32, y: i32| x + y).unwrap();
    let terminator = add.output(0).unwrap().terminate::<i32>().unwrap();

    add.input(0).unwrap().add_value(2).unwrap();
    add.input(1).unwrap().add_value(2).unwrap();

    terminator.wait_for_results_timeout(1, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![4]);
    assert!(terminator.exceptions().is_empty());
}

/// A slow first invocation still publishes before a fast second one
#[test]
fn test_slow_first_invocation_publishes_first() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let add = Node::builder(move |x: i32, y: i32| {
        let delay = if counter.fetch_add(1, Ordering::SeqCst) == 0 { 300 } else { 10 };
        thread::sleep(Duration::from_millis(delay));
        x + y
    })
    .concurrency(2)
    .build()
    .unwrap();
    let terminator = add.output(0).unwrap().terminate::<i32>().unwrap();

    let x = add.input(0).unwrap();
    let y = add.input(1).unwrap();
    x.add_value(2).unwrap();
    x.add_value(3).unwrap();
    y.add_value(2).unwrap();
    y.add_value(3).unwrap();

    terminator.wait_for_results_timeout(2, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![4, 6]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// A timed wait gives up early without reporting anything
#[test]
fn test_timed_wait_on_slow_node() {
    init_tracing();
    let slow = Node::new(|x: i32| {
        thread::sleep(Duration::from_millis(5000));
        x
    })
    .unwrap();
    let terminator = slow.output(0).unwrap().terminate::<i32>().unwrap();
    slow.input(0).unwrap().add_value(1).unwrap();

    let started = Instant::now();
    let err = terminator.wait_for_results_ms(1, 200).unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, FlowError::Timeout { .. }));
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_millis(2000));
    assert_eq!(terminator.result_count(), 0);
    assert_eq!(terminator.exception_count(), 0);
}

/// Chained nodes: inc(1) feeds pow(x, 5)
#[test]
fn test_chained_nodes() {
    init_tracing();
    let inc = Node::new(|x: f64| x + 1.0).unwrap();
    let pow = Node::new(|x: f64, y: f64| x.powf(y)).unwrap();
    let terminator = pow.output(0).unwrap().terminate::<f64>().unwrap();

    pow.input(0).unwrap().add_output(inc.output(0).unwrap()).unwrap();
    pow.input(1).unwrap().add_repeating(5.0f64).unwrap();
    inc.input(0).unwrap().add_value(1.0f64).unwrap();

    terminator.wait_for_results_timeout(1, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![32.0]);
}

/// A repeating constant keeps feeding every invocation
#[test]
fn test_repeating_constant_feeds_many_invocations() {
    init_tracing();
    let scale = Node::new(|x: i64, factor: i64| x * factor).unwrap();
    let terminator = scale.output(0).unwrap().terminate::<i64>().unwrap();
    scale.input(1).unwrap().add_repeating(3i64).unwrap();
    scale.input(0).unwrap().add_values(0..50i64).unwrap();

    terminator.wait_for_results_timeout(50, WAIT).unwrap();
    let expected: Vec<i64> = (0..50).map(|x| x * 3).collect();
    assert_eq!(terminator.results(), expected);
}

/// With a limit of one, results follow capture order despite random delays
#[test]
fn test_serial_node_preserves_order() {
    init_tracing();
    let echo = Node::new(|x: u32| {
        thread::sleep(Duration::from_millis(fastrand::u64(0..8)));
        x
    })
    .unwrap();
    let terminator = echo.output(0).unwrap().terminate::<u32>().unwrap();
    echo.input(0).unwrap().add_values(0..30u32).unwrap();

    terminator.wait_for_results_timeout(30, WAIT).unwrap();
    assert_eq!(terminator.results(), (0..30).collect::<Vec<_>>());
}

/// With several invocations in flight, results follow launch order
#[test]
fn test_parallel_node_publishes_in_launch_order() {
    init_tracing();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running_in, peak_in) = (Arc::clone(&running), Arc::clone(&peak));
    let echo = Node::builder(move |x: u32| {
        let now = running_in.fetch_add(1, Ordering::SeqCst) + 1;
        peak_in.fetch_max(now, Ordering::SeqCst);
        // Earlier invocations tend to take longer
        thread::sleep(Duration::from_millis(fastrand::u64(0..5) + u64::from(40 - x)));
        running_in.fetch_sub(1, Ordering::SeqCst);
        x
    })
    .concurrency(4)
    .build()
    .unwrap();
    let terminator = echo.output(0).unwrap().terminate::<u32>().unwrap();
    echo.input(0).unwrap().add_values(0..40u32).unwrap();

    terminator.wait_for_results_timeout(40, WAIT).unwrap();
    assert_eq!(terminator.results(), (0..40).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

/// Ordering holds across a chain of parallel nodes
#[test]
fn test_parallel_chain_keeps_order() {
    init_tracing();
    let jitter = || thread::sleep(Duration::from_millis(fastrand::u64(0..6)));
    let double = Node::builder(move |x: u64| {
        jitter();
        x * 2
    })
    .concurrency(3)
    .build()
    .unwrap();
    let offset = Node::builder(move |x: u64| {
        jitter();
        x + 1
    })
    .concurrency(3)
    .build()
    .unwrap();
    offset.input(0).unwrap().add_output(double.output(0).unwrap()).unwrap();
    let terminator = offset.output(0).unwrap().terminate::<u64>().unwrap();

    double.input(0).unwrap().add_values(0..25u64).unwrap();

    terminator.wait_for_results_timeout(25, WAIT).unwrap();
    let expected: Vec<u64> = (0..25).map(|x| x * 2 + 1).collect();
    assert_eq!(terminator.results(), expected);
}

/// Returned errors reach the terminator and the node keeps going
#[test]
fn test_returned_errors_are_collected() {
    init_tracing();
    let checked = Node::try_builder(|x: i32| -> anyhow::Result<i32> {
        if x < 0 {
            anyhow::bail!("negative input");
        }
        Ok(x * 10)
    })
    .name("checked")
    .build()
    .unwrap();
    let terminator = checked.output(0).unwrap().terminate::<i32>().unwrap();
    checked.input(0).unwrap().add_values(vec![1, -1, 2]).unwrap();

    terminator.wait_for_results_timeout(3, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![10, 20]);

    let errors = terminator.exceptions();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node(), Some("checked"));
    assert_eq!(errors[0].arguments().len(), 1);
    assert_eq!(format!("{:?}", errors[0].arguments()[0]), "-1");
    assert!(errors[0].to_string().contains("negative input"));
}

/// A panicking body is reported like an error and does not stop the node
#[test]
fn test_panics_are_contained() {
    init_tracing();
    let divide = Node::new(|x: i32| {
        if x == 0 {
            panic!("division by zero");
        }
        100 / x
    })
    .unwrap();
    let terminator = divide.output(0).unwrap().terminate::<i32>().unwrap();
    divide.input(0).unwrap().add_values(vec![0, 4, 0, 5]).unwrap();

    terminator.wait_for_results_timeout(4, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![25, 20]);
    let errors = terminator.exceptions();
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .all(|err| err.to_string().contains("panicked: division by zero")));
}

/// Results of a node after a failure still wait for earlier invocations
#[test]
fn test_failure_does_not_break_ordering() {
    init_tracing();
    let sink = Arc::new(BufferingEventSink::new());
    let node = Node::try_builder(|x: u32| -> anyhow::Result<u32> {
        thread::sleep(Duration::from_millis(u64::from(10 - x) * 5));
        if x == 3 {
            anyhow::bail!("three");
        }
        Ok(x)
    })
    .concurrency(4)
    .event_sink(sink.clone())
    .build()
    .unwrap();
    let terminator = node.output(0).unwrap().terminate::<u32>().unwrap();
    node.input(0).unwrap().add_values(0..10u32).unwrap();

    terminator.wait_for_results_timeout(10, WAIT).unwrap();
    assert_eq!(terminator.results(), vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
    assert!(sink
        .events_for(3)
        .iter()
        .any(|event| matches!(event, NodeEvent::InvocationFailed { .. })));
}
