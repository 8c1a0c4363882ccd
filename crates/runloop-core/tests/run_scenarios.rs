use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use runloop_core::{
    CategoryPolicy, CircuitState, MemoryPersistence, MemoryStore, RunScheduler, RunServices, RunloopConfig,
    StartOutcome, Worker,
};
use runloop_providers::{Provider, ProviderRegistry, ScriptedProvider, ScriptedTurn};
use runloop_tools::{FnTool, ToolRegistry};
use runloop_types::{
    Message, RunRequest, RunState, RunStatus, StreamEvent, StreamEventKind, ToolCategory, ToolOutput,
};

struct Engine {
    scheduler: RunScheduler,
    provider: Arc<ScriptedProvider>,
}

async fn engine(config: RunloopConfig, turns: Vec<ScriptedTurn>, tools: Vec<FnTool>) -> Engine {
    let provider = Arc::new(ScriptedProvider::new(turns));
    let registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Arc::new(tool)).await.expect("register tool");
    }
    let services = RunServices::new(
        config,
        Arc::new(MemoryStore::new()),
        registry,
        ProviderRegistry::with_providers(vec![provider.clone() as Arc<dyn Provider>], None),
        Arc::new(MemoryPersistence::new()),
    );
    Engine {
        scheduler: RunScheduler::new(services, "worker-a"),
        provider,
    }
}

impl Engine {
    async fn submit(&self, prompt: &str) -> RunRequest {
        let thread_id = format!("thread-{}", uuid_like(prompt));
        self.scheduler
            .services()
            .persistence
            .append_message(&Message::user(&thread_id, prompt))
            .await
            .expect("seed prompt");
        let submission = self
            .scheduler
            .submit_run(&thread_id, "acct", prompt)
            .await
            .expect("submit");
        let request = self
            .scheduler
            .claim_next(Duration::from_millis(10))
            .await
            .expect("claim")
            .expect("queued request");
        assert_eq!(request.run_id, submission.run_id);
        request
    }

    async fn run(&self, request: RunRequest) -> RunState {
        match self.scheduler.start_claimed(request).await.expect("start") {
            StartOutcome::Finished(state) => state,
            other => panic!("run did not start: {other:?}"),
        }
    }

    async fn events(&self, run_id: &str) -> Vec<StreamEvent> {
        self.scheduler
            .services()
            .events
            .read(run_id, None, 10_000)
            .await
            .expect("read events")
    }
}

fn uuid_like(seed: &str) -> String {
    seed.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

fn network_config(timeout_ms: u64, failure_threshold: u32) -> RunloopConfig {
    let mut config = RunloopConfig::default();
    config.gateway.categories.insert(
        ToolCategory::NETWORK_LOOKUP.to_string(),
        CategoryPolicy {
            timeout_ms,
            failure_threshold,
            success_threshold: 1,
            cooldown_ms: 60_000,
        },
    );
    config
}

fn lookup_tool(calls: Arc<AtomicUsize>) -> FnTool {
    FnTool::new(
        "lookup",
        "Looks something up",
        json!({"type": "object", "properties": {"q": {"type": "string"}}, "required": ["q"]}),
        move |args, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ToolOutput::ok(format!("result for {}", args["q"]))) }.boxed()
        },
    )
    .with_category(ToolCategory::network_lookup())
    .with_parallel_safe(true)
}

fn slow_tool(name: &str, sleep: Duration, calls: Arc<AtomicUsize>) -> FnTool {
    FnTool::new(name, "Takes its time", json!({"type": "object"}), move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(sleep).await;
            Ok(ToolOutput::ok("finally"))
        }
        .boxed()
    })
    .with_category(ToolCategory::network_lookup())
}

#[tokio::test(start_paused = true)]
async fn concurrent_claims_start_exactly_one_orchestrator() {
    let engine = engine(
        RunloopConfig::default(),
        vec![ScriptedTurn::text("only once").delayed(Duration::from_secs(5))],
        vec![],
    )
    .await;
    let request = engine.submit("race").await;
    let attempts = (0..8).map(|_| {
        let scheduler = engine.scheduler.clone();
        let request = request.clone();
        tokio::spawn(async move { scheduler.start_claimed(request).await.expect("start") })
    });
    let outcomes = futures::future::join_all(attempts).await;

    let mut finished = 0;
    let mut held = 0;
    for outcome in outcomes {
        match outcome.expect("join") {
            StartOutcome::Finished(state) => {
                finished += 1;
                assert_eq!(state.status, RunStatus::Completed);
            }
            StartOutcome::AlreadyHeld => held += 1,
            StartOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
        }
    }
    assert_eq!(finished, 1);
    assert_eq!(held, 7);
    assert_eq!(engine.provider.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn three_iteration_run_ends_with_done_and_gapless_sequences() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        RunloopConfig::default(),
        vec![
            ScriptedTurn::tool_call("c1", "lookup", json!({"q": "weather"})).with_text("Checking. "),
            ScriptedTurn::tool_call("c2", "lookup", json!({"q": "forecast"})),
            ScriptedTurn::text("It will be sunny."),
        ],
        vec![lookup_tool(calls.clone())],
    )
    .await;
    let request = engine.submit("weather?").await;
    let state = engine.run(request.clone()).await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.iteration_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let events = engine.events(&request.run_id).await;
    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, expected as u64);
    }
    let last = events.last().expect("events");
    assert!(last.is_done());
    assert_eq!(last.payload["status"], "completed");
    let count = |kind: StreamEventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(StreamEventKind::ToolCall), 2);
    assert_eq!(count(StreamEventKind::ToolResult), 2);
    assert_eq!(count(StreamEventKind::Done), 1);

    // Each model request after the first carries the tool results so far.
    let requests = engine.provider.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].iter().filter(|m| m.role == "tool").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reader_resumes_from_last_seen_sequence() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        RunloopConfig::default(),
        vec![
            ScriptedTurn::tool_call("c1", "lookup", json!({"q": "a"})),
            ScriptedTurn::text("done"),
        ],
        vec![lookup_tool(calls)],
    )
    .await;
    let request = engine.submit("resume").await;
    let events_api = engine.scheduler.services().events.clone();
    let run_id = request.run_id.clone();
    let reader = tokio::spawn(async move {
        let stream = events_api.tail(&run_id, None);
        futures::pin_mut!(stream);
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event.expect("event"));
            if seen.len() == 4 {
                break;
            }
        }
        seen
    });
    engine.run(request.clone()).await;
    let first_part = reader.await.expect("reader");
    let resume_from = first_part.last().expect("some events").sequence;

    let rest: Vec<StreamEvent> = engine
        .scheduler
        .services()
        .events
        .tail(&request.run_id, Some(resume_from))
        .map(|event| event.expect("event"))
        .collect()
        .await;
    let all = engine.events(&request.run_id).await;
    let expected: Vec<u64> = all
        .iter()
        .map(|e| e.sequence)
        .filter(|seq| *seq > resume_from)
        .collect();
    assert_eq!(rest.iter().map(|e| e.sequence).collect::<Vec<_>>(), expected);
    assert!(rest.last().is_some_and(|e| e.is_done()));
}

#[tokio::test(start_paused = true)]
async fn hanging_tool_times_out_and_run_continues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        network_config(2_000, 5),
        vec![
            ScriptedTurn::tool_call("c1", "sleepy", json!({})),
            ScriptedTurn::text("The lookup hung, answering without it."),
        ],
        vec![slow_tool("sleepy", Duration::from_secs(10), calls)],
    )
    .await;
    let request = engine.submit("hang").await;
    let started = Instant::now();
    let state = engine.run(request.clone()).await;
    let elapsed = started.elapsed();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2_500), "took {elapsed:?}");
    let result = engine
        .events(&request.run_id)
        .await
        .into_iter()
        .find(|e| e.kind == StreamEventKind::ToolResult)
        .expect("tool result");
    assert_eq!(result.payload["status"], "TIMED_OUT");
    assert_eq!(result.payload["error_code"], "TOOL_TIMEOUT");
}

#[tokio::test(start_paused = true)]
async fn stop_during_tool_call_is_bounded_by_tool_timeout() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        network_config(3_000, 5),
        vec![ScriptedTurn::tool_calls(&[
            ("c1", "slow", json!({})),
            ("c2", "slow", json!({})),
        ])],
        vec![slow_tool("slow", Duration::from_secs(10), calls.clone())],
    )
    .await;
    let request = engine.submit("stop me").await;
    let scheduler = engine.scheduler.clone();
    let run_id = request.run_id.clone();
    let started = Instant::now();
    let run = tokio::spawn(async move { scheduler.start_claimed(request).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.scheduler.stop_run(&run_id).await.expect("stop"));
    assert!(!engine.scheduler.stop_run(&run_id).await.expect("second stop is a no-op"));

    let outcome = run.await.expect("join").expect("start");
    let elapsed = started.elapsed();
    let StartOutcome::Finished(state) = outcome else {
        panic!("run did not start");
    };
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(elapsed <= Duration::from_millis(3_200), "took {elapsed:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = engine.events(&run_id).await;
    let skipped = events
        .iter()
        .find(|e| e.kind == StreamEventKind::ToolResult && e.payload["call_id"] == "c2")
        .expect("second call reported");
    assert_eq!(skipped.payload["error_code"], "RUN_STOPPING");
    let statuses: Vec<_> = events
        .iter()
        .filter(|e| e.kind == StreamEventKind::Status)
        .map(|e| e.payload["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(statuses.contains(&"stopping".to_string()));
    assert_eq!(statuses.last().map(String::as_str), Some("stopped"));
    assert!(events.last().is_some_and(|e| e.is_done()));
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_streaming_model_turn() {
    let engine = engine(RunloopConfig::default(), vec![ScriptedTurn::hang()], vec![]).await;
    let request = engine.submit("long answer").await;
    let scheduler = engine.scheduler.clone();
    let run_id = request.run_id.clone();
    let run = tokio::spawn(async move { scheduler.start_claimed(request).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stop_sent = Instant::now();
    engine.scheduler.stop_run(&run_id).await.expect("stop");
    let StartOutcome::Finished(state) = run.await.expect("join").expect("start") else {
        panic!("run did not start");
    };
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(stop_sent.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn open_breaker_fails_fast_across_the_category() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = FnTool::new("flaky", "Always breaks", json!({"type": "object"}), move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<ToolOutput, _>(anyhow::anyhow!("upstream 502")) }.boxed()
    })
    .with_category(ToolCategory::network_lookup());
    let engine = engine(
        network_config(2_000, 2),
        vec![
            ScriptedTurn::tool_calls(&[
                ("c1", "flaky", json!({})),
                ("c2", "flaky", json!({})),
                ("c3", "flaky", json!({})),
                ("c4", "flaky", json!({})),
            ]),
            ScriptedTurn::text("Lookups are down."),
        ],
        vec![flaky],
    )
    .await;
    let request = engine.submit("breaker").await;
    let state = engine.run(request.clone()).await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let codes: Vec<_> = engine
        .events(&request.run_id)
        .await
        .into_iter()
        .filter(|e| e.kind == StreamEventKind::ToolResult)
        .map(|e| e.payload["error_code"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(codes, vec!["TOOL_ERROR", "TOOL_ERROR", "TOOL_UNAVAILABLE", "TOOL_UNAVAILABLE"]);

    let gateway = &engine.scheduler.services().gateway;
    let snapshot = gateway.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].state, CircuitState::Open);
    assert_eq!(snapshot[0].rejected_calls, 2);
}

type Spans = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

fn timed_tool(name: &str, parallel_safe: bool, spans: Spans) -> FnTool {
    FnTool::new(name, "Sleeps for a second", json!({"type": "object"}), move |args, _| {
        let spans = spans.clone();
        async move {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_secs(1)).await;
            let call = args["call"].as_str().unwrap_or_default().to_string();
            spans.lock().push((call, started, Instant::now()));
            Ok(ToolOutput::ok("slept"))
        }
        .boxed()
    })
    .with_parallel_safe(parallel_safe)
}

#[tokio::test(start_paused = true)]
async fn sequential_call_never_overlaps_parallel_neighbours() {
    let spans: Spans = Arc::new(Mutex::new(Vec::new()));
    let engine = engine(
        RunloopConfig::default(),
        vec![
            ScriptedTurn::tool_calls(&[
                ("c1", "fetch", json!({"call": "c1"})),
                ("c2", "fetch", json!({"call": "c2"})),
                ("c3", "write", json!({"call": "c3"})),
                ("c4", "fetch", json!({"call": "c4"})),
            ]),
            ScriptedTurn::text("all done"),
        ],
        vec![
            timed_tool("fetch", true, spans.clone()),
            timed_tool("write", false, spans.clone()),
        ],
    )
    .await;
    let request = engine.submit("mixed batch").await;
    let started = Instant::now();
    let state = engine.run(request.clone()).await;
    let elapsed = started.elapsed();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(elapsed >= Duration::from_secs(3), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_500), "took {elapsed:?}");

    let spans = spans.lock().clone();
    let span = |call: &str| {
        spans
            .iter()
            .find(|(name, _, _)| name == call)
            .map(|(_, start, end)| (*start, *end))
            .expect("call ran")
    };
    let (c1, c2, c3, c4) = (span("c1"), span("c2"), span("c3"), span("c4"));
    assert!(c2.0 < c1.1 && c1.0 < c2.1, "parallel-safe neighbours overlap");
    assert!(c3.0 >= c1.1.max(c2.1));
    assert!(c4.0 >= c3.1);

    let results: Vec<_> = engine
        .events(&request.run_id)
        .await
        .into_iter()
        .filter(|e| e.kind == StreamEventKind::ToolResult)
        .map(|e| e.payload["call_id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(results, vec!["c1", "c2", "c3", "c4"]);
}

#[tokio::test(start_paused = true)]
async fn worker_drains_queue_with_bounded_concurrency() {
    let mut config = RunloopConfig::default();
    config.worker.concurrency = 2;
    config.worker.claim_poll_ms = 50;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let busy = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        FnTool::new("busy", "Occupies the run", json!({"type": "object"}), move |_, _| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutput::ok("done"))
            }
            .boxed()
        })
    };
    // Turns are shared: each run keeps taking turns until it draws a text one.
    let mut turns: Vec<_> = (0..3)
        .map(|i| ScriptedTurn::tool_call(&format!("c{i}"), "busy", json!({})))
        .collect();
    turns.extend((0..3).map(|i| ScriptedTurn::text(&format!("answer {i}"))));
    let engine = engine(config, turns, vec![busy]).await;
    let mut run_ids = Vec::new();
    for i in 0..3 {
        let submission = engine
            .scheduler
            .submit_run(&format!("thread-{i}"), "acct", &format!("key-{i}"))
            .await
            .expect("submit");
        run_ids.push(submission.run_id);
    }

    let shutdown = CancellationToken::new();
    let worker = Worker::new(engine.scheduler.clone());
    let worker_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let persistence = engine.scheduler.services().persistence.clone();
    let mut completed = 0;
    for _ in 0..200 {
        completed = 0;
        for run_id in &run_ids {
            let state = persistence.load_run_state(run_id).await.expect("load");
            if state.is_some_and(|s| s.status == RunStatus::Completed) {
                completed += 1;
            }
        }
        if completed == run_ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(completed, 3);
    shutdown.cancel();
    handle.await.expect("worker stops");
    assert_eq!(engine.scheduler.queue_depth().await.expect("depth"), 0);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}
