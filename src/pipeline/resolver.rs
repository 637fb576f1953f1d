//! Per-address resolution state machine.
//!
//! ```text
//! Pending → CacheCheck ─ fresh ─────────────────────────────→ Resolved
//!              │ miss/stale
//!              ▼
//!           ApiCall ─ ok ───────────────────────────────────→ Resolved
//!              │ transient/throttled → RetryWait → ApiCall
//!              │ blocked (or throttled, retries exhausted)
//!              ▼
//!           FallbackCall ─ ok ──────────────────────────────→ Resolved
//!              └ any failure ───────────────────────────────→ Unresolved
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{AddressCache, CacheLookup};
use crate::geocode::{GeocodeResult, NormalizedAddress, ResolveError, ResolveResult};
use crate::lifecycle::RunCancellation;
use crate::provider::GeocodeProvider;
use crate::resilience::{BlockCircuit, RetryDecision, RetryPolicy};

/// Resolves addresses for one run.
///
/// Cache, providers and the block circuit are shared across runs; the quota
/// latch belongs to the run.
pub struct ResolutionPipeline {
    cache: AddressCache,
    primary: Arc<dyn GeocodeProvider>,
    fallback: Option<Arc<dyn GeocodeProvider>>,
    retry: RetryPolicy,
    circuit: Arc<BlockCircuit>,
    quota_exhausted: AtomicBool,
}

impl ResolutionPipeline {
    pub fn new(
        cache: AddressCache,
        primary: Arc<dyn GeocodeProvider>,
        fallback: Option<Arc<dyn GeocodeProvider>>,
        retry: RetryPolicy,
        circuit: Arc<BlockCircuit>,
    ) -> Self {
        Self {
            cache,
            primary,
            fallback,
            retry,
            circuit,
            quota_exhausted: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    /// Whether some address in this run hit the provider's quota.
    pub fn quota_exhausted(&self) -> bool {
        self.quota_exhausted.load(Ordering::Acquire)
    }

    /// Resolve one normalized address.
    ///
    /// Successful remote results are in the cache before this returns.
    pub async fn resolve(&self, key: &NormalizedAddress, cancel: &RunCancellation) -> ResolveResult<GeocodeResult> {
        if key.is_empty() {
            return Err(ResolveError::Unresolvable("empty address".into()));
        }

        let stale = match self.cache.lookup(key) {
            CacheLookup::Fresh(hit) => {
                tracing::debug!(address = %key, "Cache hit");
                return Ok(hit);
            }
            CacheLookup::Stale(old) => Some(old),
            CacheLookup::Miss => None,
        };

        match self.resolve_remote(key, cancel).await {
            Ok(result) => {
                self.cache.put(key.clone(), result.clone());
                Ok(result)
            }
            Err(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
            Err(e) => match stale {
                Some(old) => {
                    tracing::warn!(
                        address = %key,
                        error = %e,
                        resolved_at = old.resolved_at,
                        "Re-resolution failed, using stale cache entry"
                    );
                    Ok(old)
                }
                None => Err(e),
            },
        }
    }

    async fn resolve_remote(&self, key: &NormalizedAddress, cancel: &RunCancellation) -> ResolveResult<GeocodeResult> {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        self.check_quota()?;

        let escalation = match self.circuit.allow_api() {
            Some(pass) => match self.call_primary(key, cancel).await {
                Ok(result) => {
                    pass.success();
                    return Ok(result);
                }
                Err(e) if e.indicates_block() => {
                    pass.block();
                    e.to_string()
                }
                // Dropping the pass unsettled frees the half-open slot.
                Err(ResolveError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(e) => {
                    // The API answered; it just could not help with this address.
                    pass.success();
                    if matches!(e, ResolveError::QuotaExhausted(_)) {
                        if !self.quota_exhausted.swap(true, Ordering::AcqRel) {
                            tracing::error!(address = %key, error = %e, "Provider quota exhausted, stopping API use for this run");
                        }
                        return Err(e);
                    }
                    return Err(match e {
                        ResolveError::Transient(reason) => ResolveError::Unresolvable(format!(
                            "gave up after {} attempts: {}",
                            self.retry.max_attempts(),
                            reason
                        )),
                        other => other,
                    });
                }
            },
            None => "provider circuit open".to_string(),
        };

        self.call_fallback(key, &escalation, cancel).await
    }

    fn check_quota(&self) -> ResolveResult<()> {
        if self.quota_exhausted() {
            return Err(ResolveError::QuotaExhausted("quota exhausted earlier in this run".into()));
        }
        Ok(())
    }

    /// API attempts with backoff. Returns the last error once retries are spent.
    async fn call_primary(&self, key: &NormalizedAddress, cancel: &RunCancellation) -> ResolveResult<GeocodeResult> {
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                outcome = self.primary.geocode(key) => outcome,
                _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            };
            let err = match outcome {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            match self.retry.decide(attempt, &err) {
                RetryDecision::GiveUp => return Err(err),
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(
                        address = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying provider call"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                    }
                    self.check_quota()?;
                    attempt += 1;
                }
            }
        }
    }

    /// One fallback attempt. Any failure is final.
    async fn call_fallback(
        &self,
        key: &NormalizedAddress,
        escalation: &str,
        cancel: &RunCancellation,
    ) -> ResolveResult<GeocodeResult> {
        let Some(fallback) = &self.fallback else {
            return Err(ResolveError::Unresolvable(format!(
                "{}; no fallback configured",
                escalation
            )));
        };
        tracing::info!(address = %key, reason = %escalation, "Escalating to fallback");

        let outcome = tokio::select! {
            outcome = fallback.geocode(key) => outcome,
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
            Err(e) => Err(ResolveError::Unresolvable(format!("fallback failed: {}", e))),
        }
    }
}

impl std::fmt::Debug for ResolutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionPipeline")
            .field("primary", &self.primary.source())
            .field("fallback", &self.fallback.as_ref().map(|p| p.source()))
            .field("quota_exhausted", &self.quota_exhausted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitConfig, RetryConfig};
    use crate::geocode::{normalize, Coordinate, Precision, ResolutionSource};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use crate::resilience::CircuitState;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Provider replaying a script of outcomes, then succeeding.
    struct Scripted {
        source: ResolutionSource,
        script: Mutex<VecDeque<ResolveError>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(source: ResolutionSource, script: Vec<ResolveError>) -> Arc<Self> {
            Arc::new(Self {
                source,
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeProvider for Scripted {
        fn source(&self) -> ResolutionSource {
            self.source
        }

        async fn geocode(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.lock().pop_front() {
                return Err(err);
            }
            Ok(GeocodeResult {
                location: Coordinate::new(121.47, 31.23),
                formatted_address: address.as_str().to_string(),
                confidence: 80,
                precision: Precision::Street,
                source: self.source,
                resolved_at: 1_000,
            })
        }
    }

    /// Provider that never answers.
    struct Silent;

    #[async_trait]
    impl GeocodeProvider for Silent {
        fn source(&self) -> ResolutionSource {
            ResolutionSource::Api
        }

        async fn geocode(&self, _address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
            std::future::pending().await
        }
    }

    fn pipeline(primary: Arc<Scripted>, fallback: Option<Arc<Scripted>>, max_attempts: u32) -> ResolutionPipeline {
        ResolutionPipeline::new(
            AddressCache::in_memory(u64::MAX),
            primary,
            fallback.map(|f| f as Arc<dyn GeocodeProvider>),
            RetryPolicy::new(&RetryConfig {
                max_attempts,
                base_delay_ms: 10,
                max_delay_ms: 50,
            }),
            Arc::new(BlockCircuit::new(&CircuitConfig {
                failure_threshold: 0,
                cooldown_secs: 60,
            })),
        )
    }

    fn transient() -> ResolveError {
        ResolveError::Transient("timeout".into())
    }

    fn throttled() -> ResolveError {
        ResolveError::Throttled("429".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_succeeds() {
        let api = Scripted::new(ResolutionSource::Api, vec![transient(), transient()]);
        let p = pipeline(api.clone(), None, 3);
        let got = p.resolve(&normalize("a"), &RunCancellation::new()).await.unwrap();
        assert_eq!(got.source, ResolutionSource::Api);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausted_is_unresolvable_without_fallback() {
        let api = Scripted::new(ResolutionSource::Api, vec![transient(); 5]);
        let browser = Scripted::new(ResolutionSource::Browser, vec![]);
        let p = pipeline(api.clone(), Some(browser.clone()), 3);
        let err = p.resolve(&normalize("a"), &RunCancellation::new()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable(_)));
        assert_eq!(api.calls(), 3);
        assert_eq!(browser.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_exhausted_escalates_once() {
        let api = Scripted::new(ResolutionSource::Api, vec![throttled(); 3]);
        let browser = Scripted::new(ResolutionSource::Browser, vec![]);
        let p = pipeline(api.clone(), Some(browser.clone()), 3);
        let got = p.resolve(&normalize("a"), &RunCancellation::new()).await.unwrap();
        assert_eq!(got.source, ResolutionSource::Browser);
        assert_eq!(api.calls(), 3);
        assert_eq!(browser.calls(), 1);
    }

    #[tokio::test]
    async fn test_blocked_goes_straight_to_fallback() {
        let api = Scripted::new(ResolutionSource::Api, vec![ResolveError::ProviderBlocked("403".into())]);
        let browser = Scripted::new(ResolutionSource::Browser, vec![]);
        let p = pipeline(api.clone(), Some(browser.clone()), 3);
        let key = normalize("a");
        p.resolve(&key, &RunCancellation::new()).await.unwrap();
        assert_eq!(api.calls(), 1);
        assert_eq!(browser.calls(), 1);
        assert_eq!(p.cache().get(&key).unwrap().location, Coordinate::new(121.47, 31.23));
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let api = Scripted::new(ResolutionSource::Api, vec![ResolveError::ProviderBlocked("403".into())]);
        let browser = Scripted::new(
            ResolutionSource::Browser,
            vec![ResolveError::ProviderBlocked("captcha".into())],
        );
        let p = pipeline(api.clone(), Some(browser.clone()), 3);
        let err = p.resolve(&normalize("a"), &RunCancellation::new()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable(_)));
        assert_eq!(browser.calls(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_never_retried() {
        let api = Scripted::new(ResolutionSource::Api, vec![ResolveError::Unresolvable("none".into())]);
        let p = pipeline(api.clone(), None, 5);
        assert!(p.resolve(&normalize("a"), &RunCancellation::new()).await.is_err());
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_quota_latch_stops_further_calls() {
        let api = Scripted::new(ResolutionSource::Api, vec![ResolveError::QuotaExhausted("302".into())]);
        let p = pipeline(api.clone(), None, 3);
        let cancel = RunCancellation::new();
        let first = p.resolve(&normalize("a"), &cancel).await.unwrap_err();
        let second = p.resolve(&normalize("b"), &cancel).await.unwrap_err();
        assert!(matches!(first, ResolveError::QuotaExhausted(_)));
        assert!(matches!(second, ResolveError::QuotaExhausted(_)));
        assert!(p.quota_exhausted());
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_address_never_calls() {
        let api = Scripted::new(ResolutionSource::Api, vec![]);
        let p = pipeline(api.clone(), None, 3);
        let err = p.resolve(&normalize("   "), &RunCancellation::new()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable(_)));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_served_even_when_cancelled() {
        let api = Scripted::new(ResolutionSource::Api, vec![]);
        let p = pipeline(api.clone(), None, 3);
        let cancel = RunCancellation::new();
        p.resolve(&normalize("a"), &cancel).await.unwrap();
        cancel.trigger();

        let hit = p.resolve(&normalize("a"), &cancel).await.unwrap();
        assert_eq!(hit.source, ResolutionSource::Cache);
        assert_eq!(
            p.resolve(&normalize("b"), &cancel).await.unwrap_err(),
            ResolveError::Cancelled
        );
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let api = Scripted::new(ResolutionSource::Api, vec![transient(); 10]);
        let p = pipeline(api.clone(), None, 10);
        let cancel = RunCancellation::new();
        let trigger = {
            let cancel = cancel.clone();
            async move {
                tokio::task::yield_now().await;
                cancel.trigger();
            }
        };
        let key = normalize("a");
        let (outcome, _) = tokio::join!(p.resolve(&key, &cancel), trigger);
        assert_eq!(outcome.unwrap_err(), ResolveError::Cancelled);
        assert!(api.calls() < 10);
    }

    #[tokio::test]
    async fn test_stale_entry_used_when_refresh_fails() {
        let clock = Arc::new(crate::clock::ManualClock::new(1_000));
        let cache = AddressCache::with_clock(None, 100, clock.clone());
        let key = normalize("a");
        let old = GeocodeResult {
            location: Coordinate::new(1.0, 2.0),
            formatted_address: "a".into(),
            confidence: 70,
            precision: Precision::City,
            source: ResolutionSource::Api,
            resolved_at: 500,
        };
        cache.put(key.clone(), old);

        let api = Scripted::new(ResolutionSource::Api, vec![ResolveError::Unresolvable("none".into())]);
        let p = ResolutionPipeline::new(
            cache,
            api.clone(),
            None,
            RetryPolicy::default(),
            Arc::new(BlockCircuit::new(&CircuitConfig::default())),
        );
        let got = p.resolve(&key, &RunCancellation::new()).await.unwrap();
        assert_eq!(got.location, Coordinate::new(1.0, 2.0));
        assert_eq!(got.source, ResolutionSource::Cache);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_api() {
        let api = Scripted::new(
            ResolutionSource::Api,
            vec![ResolveError::ProviderBlocked("403".into()); 2],
        );
        let browser = Scripted::new(ResolutionSource::Browser, vec![]);
        let p = ResolutionPipeline::new(
            AddressCache::in_memory(u64::MAX),
            api.clone(),
            Some(browser.clone() as Arc<dyn GeocodeProvider>),
            RetryPolicy::default(),
            Arc::new(BlockCircuit::new(&CircuitConfig {
                failure_threshold: 2,
                cooldown_secs: 600,
            })),
        );
        let cancel = RunCancellation::new();
        for name in ["a", "b", "c", "d"] {
            p.resolve(&normalize(name), &cancel).await.unwrap();
        }
        assert_eq!(api.calls(), 2);
        assert_eq!(browser.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_leaves_circuit_usable() {
        let circuit = Arc::new(BlockCircuit::new(&CircuitConfig {
            failure_threshold: 1,
            cooldown_secs: 60,
        }));
        circuit.record_block();
        assert_eq!(circuit.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(61)).await;

        let browser = Scripted::new(ResolutionSource::Browser, vec![]);
        let stuck = ResolutionPipeline::new(
            AddressCache::in_memory(u64::MAX),
            Arc::new(Silent),
            Some(browser.clone() as Arc<dyn GeocodeProvider>),
            RetryPolicy::default(),
            circuit.clone(),
        );
        let cancel = RunCancellation::new();
        let trigger = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.trigger();
            }
        };
        let key = normalize("a");
        let (outcome, _) = tokio::join!(stuck.resolve(&key, &cancel), trigger);
        assert_eq!(outcome.unwrap_err(), ResolveError::Cancelled);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // A later run gets the half-open slot and the healthy API closes the circuit.
        let api = Scripted::new(ResolutionSource::Api, vec![]);
        let next = ResolutionPipeline::new(
            AddressCache::in_memory(u64::MAX),
            api.clone(),
            Some(browser.clone() as Arc<dyn GeocodeProvider>),
            RetryPolicy::default(),
            circuit.clone(),
        );
        let cancel = RunCancellation::new();
        for name in ["b", "c"] {
            let got = next.resolve(&normalize(name), &cancel).await.unwrap();
            assert_eq!(got.source, ResolutionSource::Api);
        }
        assert_eq!(api.calls(), 2);
        assert_eq!(browser.calls(), 0);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
