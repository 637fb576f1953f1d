//! Batch runs end to end over scripted providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use route_system::cache::AddressCache;
use route_system::config::{CircuitConfig, RetryConfig};
use route_system::geocode::{
    AddressRecord, FailureReason, GeocodeResult, NormalizedAddress, ResolutionSource, ResolveError,
    ResolveResult,
};
use route_system::pipeline::{BatchEvent, BatchRunner, EventSink, RunParams};
use route_system::provider::GeocodeProvider;
use route_system::resilience::{BlockCircuit, RetryPolicy};
use route_system::routing::{PlanError, PlanParams};
use route_system::RunCancellation;

mod common;

/// Provider answering from a table of per-address failures; everything else resolves.
struct FakeProvider {
    source: ResolutionSource,
    failures: HashMap<String, ResolveError>,
    /// Fail the n-th call (1-based) with this error.
    fail_on_call: Option<(u32, ResolveError)>,
    calls: AtomicU32,
    seen: Mutex<Vec<String>>,
    shutdowns: AtomicU32,
}

impl FakeProvider {
    fn new(source: ResolutionSource) -> Self {
        Self {
            source,
            failures: HashMap::new(),
            fail_on_call: None,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            shutdowns: AtomicU32::new(0),
        }
    }

    fn failing(mut self, address: &str, err: ResolveError) -> Self {
        self.failures.insert(common::key(address).as_str().to_string(), err);
        self
    }

    fn failing_call(mut self, n: u32, err: ResolveError) -> Self {
        self.fail_on_call = Some((n, err));
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeProvider for FakeProvider {
    fn source(&self) -> ResolutionSource {
        self.source
    }

    async fn geocode(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().push(address.as_str().to_string());
        tokio::task::yield_now().await;
        if let Some((at, err)) = &self.fail_on_call {
            if *at == n {
                return Err(err.clone());
            }
        }
        match self.failures.get(address.as_str()) {
            Some(err) => Err(err.clone()),
            None => Ok(common::sample_result(address, self.source)),
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(&RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    })
}

fn runner(primary: Arc<FakeProvider>) -> BatchRunner {
    BatchRunner::new(AddressCache::in_memory(3600), primary).with_retry(fast_retry())
}

fn records(addresses: &[&str]) -> Vec<AddressRecord> {
    addresses.iter().map(|a| AddressRecord::new(*a)).collect()
}

#[tokio::test]
async fn test_duplicates_resolved_once_and_fanned_in_by_index() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let runner = runner(api.clone());

    let report = runner
        .resolve_all(
            records(&["上海市A路1号", "上海市B路2号", "上海市A路1号", "上海市C路3号"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    assert_eq!(api.calls(), 3);
    assert!(report.unresolved.is_empty());
    let indices: Vec<usize> = report.stops.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(report.stops[0].geocode.location, report.stops[2].geocode.location);
    assert_eq!(report.stops[1].record.address, "上海市B路2号");
    assert_eq!(runner.cache().len(), 3);
}

#[tokio::test]
async fn test_cached_address_skipped_and_order_kept() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let cache = AddressCache::in_memory(3600);
    let a = common::key("上海市甲路");
    cache.put(a.clone(), common::sample_result(&a, ResolutionSource::Api));
    let runner = BatchRunner::new(cache, api.clone()).with_retry(fast_retry());

    let report = runner
        .resolve_all(
            records(&["上海市甲路", "上海市乙路", "上海市甲路", "上海市丙路"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    let mut seen = api.seen.lock().clone();
    seen.sort();
    let mut expected = vec![
        common::key("上海市乙路").as_str().to_string(),
        common::key("上海市丙路").as_str().to_string(),
    ];
    expected.sort();
    assert_eq!(seen, expected);

    let indices: Vec<usize> = report.stops.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    let sources: Vec<ResolutionSource> = report.stops.iter().map(|s| s.geocode.source).collect();
    assert_eq!(
        sources,
        vec![
            ResolutionSource::Cache,
            ResolutionSource::Api,
            ResolutionSource::Cache,
            ResolutionSource::Api
        ]
    );
}

#[tokio::test]
async fn test_throttled_address_escalates_to_browser() {
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing("上海市被限流路", ResolveError::Throttled("429".into())),
    );
    let browser = Arc::new(FakeProvider::new(ResolutionSource::Browser));
    let runner = runner(api.clone()).with_fallback(browser.clone());

    let report = runner
        .resolve_all(
            records(&["上海市正常路", "上海市被限流路"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    assert!(report.unresolved.is_empty());
    assert_eq!(report.stops[0].geocode.source, ResolutionSource::Api);
    assert_eq!(report.stops[1].geocode.source, ResolutionSource::Browser);
    // One clean call plus three attempts on the throttled address.
    assert_eq!(api.calls(), 4);
    assert_eq!(browser.calls(), 1);
    assert_eq!(browser.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_quota_stops_remaining_api_calls() {
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing_call(3, ResolveError::QuotaExhausted("daily quota".into())),
    );
    let runner = runner(api.clone()).with_concurrency(1);

    let report = runner
        .resolve_all(
            records(&["地址一", "地址二", "地址三", "地址四", "地址五"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    assert_eq!(api.calls(), 3);
    assert!(report.quota_exhausted);
    assert_eq!(report.stops.len(), 2);
    assert_eq!(report.unresolved.len(), 3);
    assert!(report
        .unresolved
        .iter()
        .all(|u| u.reason == FailureReason::QuotaExhausted));
    let indices: Vec<usize> = report.unresolved.iter().map(|u| u.index).collect();
    assert_eq!(indices, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_quota_at_full_concurrency_accounts_for_every_record() {
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing_call(3, ResolveError::QuotaExhausted("daily quota".into())),
    );
    let runner = runner(api.clone());

    let report = runner
        .resolve_all(
            records(&["地址一", "地址二", "地址三", "地址四", "地址五"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    // Calls already in flight when the latch trips still complete.
    assert!(api.calls() >= 3 && api.calls() <= 5);
    assert!(report.quota_exhausted);
    assert_eq!(report.stops.len() + report.unresolved.len(), 5);
    assert!(!report.unresolved.is_empty());
    assert!(report
        .unresolved
        .iter()
        .all(|u| u.reason == FailureReason::QuotaExhausted));
}

#[tokio::test]
async fn test_unresolvable_addresses_reported_with_the_rest_resolved() {
    let addresses: Vec<String> = (0..10).map(|i| format!("上海市测试路{}号", i)).collect();
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing(&addresses[3], ResolveError::Unresolvable("no result".into()))
            .failing(&addresses[7], ResolveError::Unresolvable("no result".into())),
    );
    let runner = runner(api.clone());
    let input: Vec<AddressRecord> = addresses
        .iter()
        .enumerate()
        .map(|(i, a)| AddressRecord::new(a.as_str()).with_id(format!("outlet-{}", i)))
        .collect();

    let report = runner
        .resolve_all(input, &RunParams::default(), &RunCancellation::new(), &EventSink::none())
        .await;

    assert_eq!(report.stops.len(), 8);
    assert_eq!(report.unresolved.len(), 2);
    assert_eq!(report.unresolved[0].index, 3);
    assert_eq!(report.unresolved[0].id.as_deref(), Some("outlet-3"));
    assert_eq!(report.unresolved[1].index, 7);
    assert_eq!(report.unresolved[1].reason, FailureReason::Unresolvable);
    // Permanent failures are not retried.
    assert_eq!(api.calls(), 10);
}

#[tokio::test]
async fn test_fresh_cache_makes_no_calls() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let cache = AddressCache::in_memory(3600);
    for address in ["上海市A路", "上海市B路"] {
        let key = common::key(address);
        let result = common::sample_result(&key, ResolutionSource::Api);
        cache.put(key, result);
    }
    let runner = BatchRunner::new(cache, api.clone());

    let report = runner
        .resolve_all(
            records(&["上海市A路", "上海市B路", "上海市A路"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    assert_eq!(api.calls(), 0);
    assert_eq!(report.stops.len(), 3);
    assert!(report.stops.iter().all(|s| s.geocode.source == ResolutionSource::Cache));
}

#[tokio::test]
async fn test_max_age_override_re_resolves_old_entries() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let cache = AddressCache::in_memory(3600);
    let key = common::key("上海市旧地址");
    let mut old = common::sample_result(&key, ResolutionSource::Api);
    old.resolved_at -= 600;
    cache.put(key, old);
    let runner = BatchRunner::new(cache, api.clone());

    let default_run = runner
        .resolve_all(records(&["上海市旧地址"]), &RunParams::default(), &RunCancellation::new(), &EventSink::none())
        .await;
    assert_eq!(default_run.stops[0].geocode.source, ResolutionSource::Cache);
    assert_eq!(api.calls(), 0);

    let params = RunParams {
        max_age_secs: Some(60),
        ..RunParams::default()
    };
    let strict_run = runner
        .resolve_all(records(&["上海市旧地址"]), &params, &RunCancellation::new(), &EventSink::none())
        .await;
    assert_eq!(strict_run.stops[0].geocode.source, ResolutionSource::Api);
    assert_eq!(api.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_run_reports_every_record() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let runner = runner(api.clone());
    let cancel = RunCancellation::new();
    cancel.trigger();

    let report = runner
        .run(
            records(&["地址一", "地址二", "地址三"]),
            &RunParams::default(),
            &cancel,
            &EventSink::none(),
        )
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(api.calls(), 0);
    assert!(report.routes.is_empty());
    assert_eq!(report.unresolved.len(), 3);
    assert!(report.unresolved.iter().all(|u| u.reason == FailureReason::Cancelled));
}

#[tokio::test]
async fn test_events_cover_every_record() {
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api).failing("坏地址", ResolveError::Unresolvable("no result".into())),
    );
    let runner = runner(api);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = runner
        .resolve_all(
            records(&["好地址", "坏地址", "好地址"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::new(tx),
        )
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(BatchEvent::Started { total: 3, distinct: 2, run_id }) if *run_id == report.run_id
    ));
    assert!(matches!(
        events.last(),
        Some(BatchEvent::Finished { resolved: 2, unresolved: 1, cancelled: false, .. })
    ));
    let mut resolved: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Resolved { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    resolved.sort_unstable();
    assert_eq!(resolved, vec![0, 2]);
    assert!(events
        .iter()
        .any(|e| matches!(e, BatchEvent::Unresolved { index: 1, reason: FailureReason::Unresolvable })));
}

#[tokio::test]
async fn test_run_plans_routes_over_resolved_stops() {
    let addresses: Vec<String> = (0..7).map(|i| format!("上海市配送点{}号", i)).collect();
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api).failing(&addresses[6], ResolveError::Unresolvable("no result".into())),
    );
    let runner = runner(api).with_plan_params(PlanParams {
        vehicle_count: 2,
        capacity: Some(4),
        ..PlanParams::default()
    });
    let input: Vec<AddressRecord> = addresses.iter().map(|a| AddressRecord::new(a.as_str())).collect();

    let report = runner
        .run(input, &RunParams::default(), &RunCancellation::new(), &EventSink::none())
        .await
        .unwrap();

    assert_eq!(report.resolved, 6);
    assert_eq!(report.unresolved.len(), 1);
    assert!(report.unrouted.is_empty());
    assert_eq!(report.routes.len(), 2);
    let mut routed: Vec<usize> = report.routes.iter().flat_map(|r| r.stop_indices()).collect();
    routed.sort_unstable();
    assert_eq!(routed, vec![0, 1, 2, 3, 4, 5]);
    assert!(report.routes.iter().all(|r| r.len() <= 4));
    // Estimated legs only, no road source configured.
    assert!(report.routes.iter().flat_map(|r| r.legs()).all(|leg| leg.estimated));
}

#[tokio::test]
async fn test_capacity_counts_only_resolved_stops() {
    let addresses: Vec<String> = (0..10).map(|i| format!("上海市仓库路{}号", i)).collect();
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing(&addresses[2], ResolveError::Unresolvable("no result".into()))
            .failing(&addresses[8], ResolveError::Unresolvable("no result".into())),
    );
    let runner = runner(api.clone());
    let params = RunParams {
        vehicle_count: Some(2),
        capacity: Some(4),
        ..RunParams::default()
    };
    let input: Vec<AddressRecord> = addresses.iter().map(|a| AddressRecord::new(a.as_str())).collect();

    let report = runner
        .run(input, &params, &RunCancellation::new(), &EventSink::none())
        .await
        .unwrap();

    assert_eq!(api.calls(), 10);
    assert_eq!(report.resolved, 8);
    let unresolved: Vec<usize> = report.unresolved.iter().map(|u| u.index).collect();
    assert_eq!(unresolved, vec![2, 8]);
    assert_eq!(report.routes.len(), 2);
    assert!(report.routes.iter().all(|r| r.len() <= 4));
    assert_eq!(report.routes.iter().map(|r| r.len()).sum::<usize>(), 8);
}

#[tokio::test]
async fn test_capacity_exceeded_by_resolved_stops() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let runner = runner(api.clone());
    let params = RunParams {
        vehicle_count: Some(2),
        capacity: Some(2),
        ..RunParams::default()
    };

    let err = runner
        .run(
            records(&["一", "二", "三", "四", "五"]),
            &params,
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PlanError::CapacityExceeded {
            stops: 5,
            vehicles: 2,
            capacity: 2
        }
    ));
    // Resolutions are kept for the next run.
    assert_eq!(runner.cache().len(), 5);
}

#[tokio::test]
async fn test_invalid_plan_params_rejected_before_any_provider_call() {
    let api = Arc::new(FakeProvider::new(ResolutionSource::Api));
    let runner = runner(api.clone());
    let params = RunParams {
        vehicle_count: Some(0),
        ..RunParams::default()
    };

    let err = runner
        .run(records(&["一", "二"]), &params, &RunCancellation::new(), &EventSink::none())
        .await
        .unwrap_err();

    assert!(matches!(err, PlanError::InvalidParams(_)));
    assert_eq!(api.calls(), 0);
}

#[tokio::test]
async fn test_open_circuit_sends_later_addresses_straight_to_browser() {
    let blocked = ResolveError::ProviderBlocked("403".into());
    let api = Arc::new(
        FakeProvider::new(ResolutionSource::Api)
            .failing("地址一", blocked.clone())
            .failing("地址二", blocked.clone())
            .failing("地址三", blocked.clone())
            .failing("地址四", blocked),
    );
    let browser = Arc::new(FakeProvider::new(ResolutionSource::Browser));
    let circuit = Arc::new(BlockCircuit::new(&CircuitConfig {
        failure_threshold: 2,
        cooldown_secs: 600,
    }));
    let runner = runner(api.clone())
        .with_fallback(browser.clone())
        .with_circuit(circuit)
        .with_concurrency(1);

    let report = runner
        .resolve_all(
            records(&["地址一", "地址二", "地址三", "地址四"]),
            &RunParams::default(),
            &RunCancellation::new(),
            &EventSink::none(),
        )
        .await;

    assert_eq!(report.stops.len(), 4);
    assert!(report.stops.iter().all(|s| s.geocode.source == ResolutionSource::Browser));
    assert_eq!(api.calls(), 2);
    assert_eq!(browser.calls(), 4);
}
