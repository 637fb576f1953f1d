//! Batch runs: fan out distinct addresses, fan results back in by input index.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::AddressCache;
use crate::geocode::{
    normalize, AddressRecord, FailureReason, GeocodeResult, NormalizedAddress, ResolveError,
    ResolveResult, ResolvedStop,
};
use crate::lifecycle::RunCancellation;
use crate::observability::metrics;
use crate::pipeline::events::{BatchEvent, EventSink};
use crate::pipeline::resolver::ResolutionPipeline;
use crate::provider::GeocodeProvider;
use crate::resilience::{BlockCircuit, RetryPolicy};
use crate::routing::{LegCache, LegMetrics, PlanError, PlanParams, Route, RouteOptimizer, StraightLine};

/// Per-run overrides of configured values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    pub vehicle_count: Option<usize>,
    pub capacity: Option<usize>,
    pub max_age_secs: Option<u64>,
}

/// An input record that did not resolve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedAddress {
    pub index: usize,
    pub id: Option<String>,
    pub address: String,
    pub reason: FailureReason,
    pub message: String,
}

/// Outcome of the resolution stage alone.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReport {
    pub run_id: Uuid,
    /// Resolved records in input order.
    pub stops: Vec<ResolvedStop>,
    /// Unresolved records in input order.
    pub unresolved: Vec<UnresolvedAddress>,
    pub cancelled: bool,
    pub quota_exhausted: bool,
}

/// Outcome of a full run, handed to the export layer.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub routes: Vec<Route>,
    /// Resolved stops left out of routing because the run was cancelled.
    pub unrouted: Vec<ResolvedStop>,
    pub unresolved: Vec<UnresolvedAddress>,
    pub resolved: usize,
    pub cancelled: bool,
    pub quota_exhausted: bool,
}

/// Runs batches through resolution and route planning.
///
/// Cache, providers and the block circuit live across runs. Quota latch and
/// leg memo are per run.
pub struct BatchRunner {
    cache: AddressCache,
    primary: Arc<dyn GeocodeProvider>,
    fallback: Option<Arc<dyn GeocodeProvider>>,
    road: Option<Arc<dyn LegMetrics>>,
    estimator: StraightLine,
    retry: RetryPolicy,
    circuit: Arc<BlockCircuit>,
    plan: PlanParams,
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(cache: AddressCache, primary: Arc<dyn GeocodeProvider>) -> Self {
        Self {
            cache,
            primary,
            fallback: None,
            road: None,
            estimator: StraightLine::new(30.0),
            retry: RetryPolicy::default(),
            circuit: Arc::new(BlockCircuit::new(&Default::default())),
            plan: PlanParams::default(),
            concurrency: 8,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn GeocodeProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Measure legs on the road network instead of straight lines.
    pub fn with_road_legs(mut self, road: Arc<dyn LegMetrics>) -> Self {
        self.road = Some(road);
        self
    }

    pub fn with_estimator(mut self, estimator: StraightLine) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: Arc<BlockCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_plan_params(mut self, plan: PlanParams) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    fn plan_params(&self, params: &RunParams) -> PlanParams {
        PlanParams {
            vehicle_count: params.vehicle_count.unwrap_or(self.plan.vehicle_count),
            capacity: params.capacity.or(self.plan.capacity),
            ..self.plan.clone()
        }
    }

    fn pipeline(&self, params: &RunParams) -> ResolutionPipeline {
        let cache = match params.max_age_secs {
            Some(max_age) => self.cache.with_max_age(max_age),
            None => self.cache.clone(),
        };
        ResolutionPipeline::new(
            cache,
            self.primary.clone(),
            self.fallback.clone(),
            self.retry.clone(),
            self.circuit.clone(),
        )
    }

    /// Resolve every record. Always returns a complete report.
    pub async fn resolve_all(
        &self,
        records: Vec<AddressRecord>,
        params: &RunParams,
        cancel: &RunCancellation,
        events: &EventSink,
    ) -> ResolutionReport {
        let run_id = Uuid::new_v4();
        let report = self
            .resolve_stage(run_id, records, params, cancel, events)
            .instrument(tracing::info_span!("resolve", %run_id))
            .await;
        events.emit(BatchEvent::Finished {
            run_id,
            resolved: report.stops.len(),
            unresolved: report.unresolved.len(),
            cancelled: report.cancelled,
        });
        report
    }

    /// Resolve every record, then plan routes over the resolved ones.
    ///
    /// Invalid plan parameters fail before any provider call. Capacity is
    /// checked against the stops that actually resolved, so duplicates and
    /// unresolved records never count against it.
    pub async fn run(
        &self,
        records: Vec<AddressRecord>,
        params: &RunParams,
        cancel: &RunCancellation,
        events: &EventSink,
    ) -> Result<BatchReport, PlanError> {
        let plan = self.plan_params(params);
        plan.validate()?;

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        let report = async {
            let resolution = self.resolve_stage(run_id, records, params, cancel, events).await;
            let resolved = resolution.stops.len();

            let (routes, unrouted) = if resolution.cancelled {
                tracing::warn!(resolved, "Run cancelled, skipping route planning");
                (Vec::new(), resolution.stops)
            } else {
                let optimizer = RouteOptimizer::new(LegCache::new(self.road.clone(), self.estimator));
                (optimizer.optimize(resolution.stops, &plan).await?, Vec::new())
            };

            Ok::<_, PlanError>(BatchReport {
                run_id,
                routes,
                unrouted,
                unresolved: resolution.unresolved,
                resolved,
                cancelled: resolution.cancelled,
                quota_exhausted: resolution.quota_exhausted,
            })
        }
        .instrument(span)
        .await?;

        events.emit(BatchEvent::Finished {
            run_id,
            resolved: report.resolved,
            unresolved: report.unresolved.len(),
            cancelled: report.cancelled,
        });
        Ok(report)
    }

    /// Distinct keys resolve up to `concurrency` at a time and fan back in by
    /// input index.
    ///
    /// The quota latch stops new API calls, not calls already awaiting the
    /// provider. With concurrency above one, addresses in flight when the
    /// quota runs out may still resolve, and which ones do depends on timing.
    /// A concurrency of one gives the strict order: everything after the
    /// exhausting call is reported unresolved.
    async fn resolve_stage(
        &self,
        run_id: Uuid,
        records: Vec<AddressRecord>,
        params: &RunParams,
        cancel: &RunCancellation,
        events: &EventSink,
    ) -> ResolutionReport {
        let pipeline = self.pipeline(params);
        let keys: Vec<NormalizedAddress> = records.iter().map(|r| normalize(&r.address)).collect();

        let mut indices_by_key: HashMap<NormalizedAddress, Vec<usize>> = HashMap::new();
        let mut distinct = Vec::new();
        let mut seen = HashSet::new();
        for (index, key) in keys.iter().enumerate() {
            indices_by_key.entry(key.clone()).or_default().push(index);
            if seen.insert(key.clone()) {
                distinct.push(key.clone());
            }
        }

        tracing::info!(total = records.len(), distinct = distinct.len(), "Resolving batch");
        events.emit(BatchEvent::Started {
            run_id,
            total: records.len(),
            distinct: distinct.len(),
        });

        let mut outcomes: HashMap<NormalizedAddress, ResolveResult<GeocodeResult>> = HashMap::new();
        {
            let pipeline = &pipeline;
            let mut resolving = std::pin::pin!(stream::iter(distinct)
                .map(|key| async move {
                    let outcome = pipeline.resolve(&key, cancel).await;
                    (key, outcome)
                })
                .buffer_unordered(self.concurrency));

            while let Some((key, outcome)) = resolving.next().await {
                for &index in indices_by_key.get(&key).into_iter().flatten() {
                    events.emit(match &outcome {
                        Ok(result) => BatchEvent::Resolved {
                            index,
                            source: result.source,
                        },
                        Err(e) => BatchEvent::Unresolved {
                            index,
                            reason: FailureReason::from(e),
                        },
                    });
                }
                outcomes.insert(key, outcome);
            }
        }

        let mut stops = Vec::new();
        let mut unresolved = Vec::new();
        for (index, (record, key)) in records.into_iter().zip(keys).enumerate() {
            let outcome = outcomes.get(&key).cloned().unwrap_or(Err(ResolveError::Cancelled));
            match outcome {
                Ok(geocode) => stops.push(ResolvedStop {
                    index,
                    record,
                    key,
                    geocode,
                }),
                Err(e) => {
                    let reason = FailureReason::from(&e);
                    metrics::record_unresolved(reason.as_str());
                    unresolved.push(UnresolvedAddress {
                        index,
                        id: record.id,
                        address: record.address,
                        reason,
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            fallback.shutdown().await;
        }
        if let Err(e) = pipeline.cache().flush() {
            tracing::error!(error = %e, "Failed to persist geocode cache");
        }

        let report = ResolutionReport {
            run_id,
            stops,
            unresolved,
            cancelled: cancel.is_cancelled(),
            quota_exhausted: pipeline.quota_exhausted(),
        };
        tracing::info!(
            resolved = report.stops.len(),
            unresolved = report.unresolved.len(),
            cancelled = report.cancelled,
            quota_exhausted = report.quota_exhausted,
            "Batch resolved"
        );
        report
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("cache", &self.cache)
            .field("fallback", &self.fallback.is_some())
            .field("road_legs", &self.road.is_some())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
