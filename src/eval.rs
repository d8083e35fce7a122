use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::attribute_value::AttributeValue;
use crate::audit::{AuditAction, AuditEvent, AuditSink, EntityType, NoopAuditSink};
use crate::bucket::{self, BucketSalt, BucketingVersion, SaltMode};
use crate::clock::{Clock, SystemClock};
use crate::condition::ConditionScope;
use crate::config::EngineConfig;
use crate::context::EvaluationContext;
use crate::error::{ConfigurationError, ErrorKind, ManagementError, ProviderError};
use crate::management::RuleStore;
use crate::provider::RuleProvider;
use crate::ruleset::ResolvedFeatures;
use crate::schedule::Schedule;
use crate::snapshot::{Snapshot, SnapshotCache};

/// The outcome of an evaluation: whether the feature is enabled and why.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub enabled: bool,
    pub reason: Reason,
    pub source: Source,
    /// Id of the schedule or targeting rule that decided, if one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_id: Option<String>,
}

impl EvaluationResult {
    pub fn new(enabled: bool, reason: Reason, source: Source) -> Self {
        Self {
            enabled,
            reason,
            source,
            matched_id: None,
        }
    }

    pub fn error(error_kind: ErrorKind, enabled: bool) -> Self {
        Self::new(
            enabled,
            Reason::ErrorFallback { error_kind },
            Source::ErrorFallback,
        )
    }

    fn matched(mut self, id: &str) -> Self {
        self.matched_id = Some(id.to_owned());
        self
    }
}

/// Reason describes why an evaluation produced its result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The kill switch was active, so the baseline ruleset decided.
    KillSwitch,
    /// The client is unknown or inactive, so the baseline ruleset decided.
    ClientNotFound,
    /// The client's ruleset could not be resolved, so the baseline ruleset decided.
    InvalidRuleset,
    Schedule,
    Targeting,
    /// An active client override decided.
    ClientOverride,
    /// The feature is disabled in the client's resolved ruleset, or absent from it and decided by
    /// the baseline.
    FeatureNotInRuleset,
    /// The feature is enabled for only part of the population and this identity fell outside it.
    PercentageRollout { percentage: u8 },
    RulesetEnabled,
    /// Evaluation failed; the result is the baseline decision when one could be made.
    ErrorFallback {
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
    },
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reason::KillSwitch => f.write_str("kill_switch"),
            Reason::ClientNotFound => f.write_str("client_not_found"),
            Reason::InvalidRuleset => f.write_str("invalid_ruleset"),
            Reason::Schedule => f.write_str("schedule"),
            Reason::Targeting => f.write_str("targeting"),
            Reason::ClientOverride => f.write_str("client_override"),
            Reason::FeatureNotInRuleset => f.write_str("feature_not_in_ruleset"),
            Reason::PercentageRollout { percentage } => {
                write!(f, "percentage_rollout_{}%", percentage)
            }
            Reason::RulesetEnabled => f.write_str("ruleset_enabled"),
            Reason::ErrorFallback { .. } => f.write_str("error_fallback"),
        }
    }
}

/// The layer that produced an [EvaluationResult].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    KillSwitch,
    Schedule,
    Targeting,
    Ruleset,
    Percentage,
    Baseline,
    ErrorFallback,
}

/// Where a client's effective feature value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSource {
    /// Assigned directly by the client's ruleset.
    Ruleset,
    /// Assigned by an ancestor of the client's ruleset.
    Inherited,
    /// Set by an active client override.
    Override,
}

/// One feature of a client as seen by [Engine::resolve_client_features].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainedFeature {
    pub enabled: bool,
    pub percentage: u8,
    pub source: FeatureSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ruleset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Applies the precedence chain to one snapshot.
pub(crate) struct Evaluator<'a> {
    snapshot: &'a Snapshot,
    salt_mode: SaltMode,
    bucketing: BucketingVersion,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(snapshot: &'a Snapshot, config: &EngineConfig) -> Self {
        Self {
            snapshot,
            salt_mode: config.salt_mode,
            bucketing: config.bucketing_version,
        }
    }

    fn scope<'s>(
        &self,
        client_id: &'s str,
        feature_name: &'s str,
        user_id: Option<&'s str>,
    ) -> ConditionScope<'s> {
        ConditionScope {
            feature_name,
            salt: user_id.map(|user_id| BucketSalt::new(self.salt_mode, client_id, user_id)),
            bucketing: self.bucketing,
        }
    }

    /// The baseline ruleset's value for `feature_name`; percentages are not applied. An
    /// unresolvable baseline decides false.
    pub(crate) fn baseline_value(&self, feature_name: &str) -> bool {
        match self.snapshot.resolve_baseline() {
            Ok(features) => features.get(feature_name).map_or(false, |f| f.enabled),
            Err(e) => {
                warn!("baseline ruleset cannot be resolved: {}", e);
                false
            }
        }
    }

    fn baseline(&self, feature_name: &str, reason: Reason, source: Source) -> EvaluationResult {
        EvaluationResult::new(self.baseline_value(feature_name), reason, source)
    }

    pub(crate) fn evaluate(
        &self,
        kill_switch: bool,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
        now: &DateTime<Utc>,
    ) -> EvaluationResult {
        if kill_switch {
            return match self.snapshot.resolve_baseline() {
                Ok(features) => EvaluationResult::new(
                    features.get(feature_name).map_or(false, |f| f.enabled),
                    Reason::KillSwitch,
                    Source::KillSwitch,
                ),
                Err(e) => {
                    warn!("kill switch active but the baseline cannot be resolved: {}", e);
                    EvaluationResult::error(ErrorKind::from(&e), false)
                }
            };
        }

        let ruleset_id = match self.snapshot.directory().get_assigned_ruleset(client_id) {
            Some(ruleset_id) => ruleset_id,
            None => return self.baseline(feature_name, Reason::ClientNotFound, Source::Baseline),
        };
        let resolved = match self.snapshot.resolve(ruleset_id) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "ruleset {} of client {} cannot be resolved: {}",
                    ruleset_id, client_id, e
                );
                return self.baseline(feature_name, Reason::InvalidRuleset, Source::Baseline);
            }
        };

        if let Some(schedule) =
            self.snapshot
                .schedules()
                .evaluate(feature_name, Some(client_id), Some(ruleset_id), now)
        {
            return EvaluationResult::new(
                schedule.enabled_during_schedule,
                Reason::Schedule,
                Source::Schedule,
            )
            .matched(&schedule.id);
        }

        let user_id = context.user_id();
        let scope = self.scope(client_id, feature_name, user_id.as_deref());

        if let Some(rule) = self
            .snapshot
            .targeting()
            .evaluate(context, Some(ruleset_id), &scope)
        {
            if let Some(enabled) = rule.decision() {
                return EvaluationResult::new(enabled, Reason::Targeting, Source::Targeting)
                    .matched(&rule.id);
            }
        }

        if let Some(o) = self
            .snapshot
            .directory()
            .active_override(client_id, feature_name, now)
        {
            return EvaluationResult::new(o.enabled, Reason::ClientOverride, Source::Ruleset);
        }

        let feature = match resolved.get(feature_name) {
            Some(feature) if feature.enabled => feature,
            Some(_) => {
                return EvaluationResult::new(false, Reason::FeatureNotInRuleset, Source::Ruleset)
            }
            None => {
                return self.baseline(feature_name, Reason::FeatureNotInRuleset, Source::Baseline)
            }
        };

        if feature.percentage < bucket::MAX_BUCKET {
            // without an identity nobody can pass the rollout gate
            let admitted = scope.salt.map_or(false, |salt| {
                salt.in_rollout(self.bucketing, feature_name, feature.percentage)
            });
            return if admitted {
                EvaluationResult::new(true, Reason::RulesetEnabled, Source::Percentage)
            } else {
                self.baseline(
                    feature_name,
                    Reason::PercentageRollout {
                        percentage: feature.percentage,
                    },
                    Source::Percentage,
                )
            };
        }

        EvaluationResult::new(true, Reason::RulesetEnabled, Source::Ruleset)
    }

    pub(crate) fn variant(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
    ) -> Option<AttributeValue> {
        let ruleset_id = self.snapshot.directory().get_assigned_ruleset(client_id);
        let user_id = context.user_id();
        let scope = self.scope(client_id, feature_name, user_id.as_deref());
        self.snapshot
            .targeting()
            .evaluate(context, ruleset_id, &scope)
            .filter(|rule| rule.decision().is_none())
            .and_then(|rule| rule.variant_value.clone())
    }

    pub(crate) fn resolve_client_features(
        &self,
        client_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<BTreeMap<String, ExplainedFeature>, ConfigurationError> {
        let ruleset_id = self
            .snapshot
            .directory()
            .get_assigned_ruleset(client_id)
            .ok_or_else(|| ConfigurationError::UnknownClient(client_id.to_owned()))?;
        let resolved: ResolvedFeatures = self.snapshot.resolve(ruleset_id)?;

        let mut features: BTreeMap<String, ExplainedFeature> = resolved
            .into_iter()
            .map(|(name, f)| {
                let source = if f.inherited {
                    FeatureSource::Inherited
                } else {
                    FeatureSource::Ruleset
                };
                let explained = ExplainedFeature {
                    enabled: f.enabled,
                    percentage: f.percentage,
                    source,
                    source_ruleset_id: Some(f.source_ruleset_id),
                    override_reason: None,
                    expires_at: None,
                };
                (name, explained)
            })
            .collect();

        for o in self.snapshot.directory().get_active_overrides(client_id, now) {
            features.insert(
                o.feature_name.clone(),
                ExplainedFeature {
                    enabled: o.enabled,
                    percentage: bucket::MAX_BUCKET,
                    source: FeatureSource::Override,
                    source_ruleset_id: None,
                    override_reason: o.reason.clone(),
                    expires_at: o.expires_at,
                },
            );
        }
        Ok(features)
    }
}

/// The feature decision engine.
///
/// An engine evaluates against the last snapshot it loaded from its [RuleProvider] and never
/// waits for a refresh unless no snapshot was ever loaded. Every evaluation produces a decision;
/// failures surface only through the [Reason] of an [EvaluationResult].
///
/// Engines are `Send + Sync`; share one behind an [Arc].
pub struct Engine {
    pub(crate) provider: Arc<dyn RuleProvider>,
    pub(crate) store: Option<Arc<dyn RuleStore>>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) cache: Arc<SnapshotCache>,
    kill_switch: AtomicBool,
    loader: Arc<Loader>,
}

/// Contains methods for configuring and building an [Engine].
pub struct EngineBuilder {
    provider: Arc<dyn RuleProvider>,
    store: Option<Arc<dyn RuleStore>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(provider: Arc<dyn RuleProvider>) -> Self {
        Self {
            provider,
            store: None,
            audit: Arc::new(NoopAuditSink),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    /// The persistence layer management operations write through. Without one, management
    /// operations fail with [ProviderError::Unavailable].
    pub fn store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            provider: self.provider,
            store: self.store,
            audit: self.audit,
            clock: self.clock,
            cache: Arc::new(SnapshotCache::new(self.config.cache_ttl)),
            config: self.config,
            kill_switch: AtomicBool::new(false),
            loader: Arc::new(Loader::default()),
        }
    }
}

/// Tracks the one snapshot load allowed in flight at a time. Callers needing a snapshot join the
/// running load instead of starting another.
#[derive(Default)]
struct Loader {
    state: Mutex<LoadState>,
    finished: Condvar,
}

#[derive(Default)]
struct LoadState {
    in_flight: bool,
    completed: u64,
    last_error: Option<ProviderError>,
}

fn load_into(
    provider: &dyn RuleProvider,
    cache: &SnapshotCache,
    clock: &dyn Clock,
) -> Result<Arc<Snapshot>, ProviderError> {
    match provider.load_snapshot() {
        Ok(snapshot) => Ok(cache.replace(snapshot, clock.now())),
        Err(e) => {
            warn!("rule snapshot refresh failed, keeping the previous one: {}", e);
            Err(e)
        }
    }
}

impl Engine {
    pub fn builder(provider: Arc<dyn RuleProvider>) -> EngineBuilder {
        EngineBuilder::new(provider)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns whether `feature_name` is enabled for `client_id`.
    pub fn evaluate(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
    ) -> bool {
        self.evaluate_detailed(client_id, feature_name, context, now)
            .enabled
    }

    pub fn evaluate_now(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
    ) -> bool {
        self.evaluate(client_id, feature_name, context, self.clock.now())
    }

    /// Evaluates `feature_name` for `client_id`, explaining the decision.
    pub fn evaluate_detailed(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        self.evaluate_detailed_with_timeout(
            client_id,
            feature_name,
            context,
            now,
            self.config.refresh_timeout,
        )
    }

    pub fn evaluate_detailed_now(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
    ) -> EvaluationResult {
        self.evaluate_detailed(client_id, feature_name, context, self.clock.now())
    }

    /// Like [Engine::evaluate_detailed], waiting at most `timeout` for the provider if no
    /// snapshot was ever loaded.
    pub fn evaluate_detailed_with_timeout(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> EvaluationResult {
        let snapshot = match self.snapshot_for_evaluation(timeout) {
            Ok(snapshot) => snapshot,
            Err(error_kind) => return EvaluationResult::error(error_kind, false),
        };
        let evaluator = Evaluator::new(&snapshot, &self.config);
        let kill_switch = self.kill_switch.load(Ordering::SeqCst);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            evaluator.evaluate(kill_switch, client_id, feature_name, context, &now)
        }));
        match outcome {
            Ok(result) => {
                debug!(
                    "{} for {}: {} ({})",
                    feature_name, client_id, result.enabled, result.reason
                );
                result
            }
            Err(_) => {
                error!(
                    "evaluation of {} for {} failed unexpectedly",
                    feature_name, client_id
                );
                let baseline =
                    panic::catch_unwind(AssertUnwindSafe(|| evaluator.baseline_value(feature_name)))
                        .unwrap_or(false);
                EvaluationResult::error(ErrorKind::Internal, baseline)
            }
        }
    }

    /// The variant value selected by the first matching targeting rule, when that rule is a
    /// variant rule. None when the kill switch is active or no snapshot is available.
    pub fn evaluate_variant(
        &self,
        client_id: &str,
        feature_name: &str,
        context: &EvaluationContext,
    ) -> Option<AttributeValue> {
        if self.kill_switch_active() {
            return None;
        }
        let snapshot = self.snapshot_for_evaluation(self.config.refresh_timeout).ok()?;
        Evaluator::new(&snapshot, &self.config).variant(client_id, feature_name, context)
    }

    /// Every feature enabled for `client_id` at `now`, deciding each feature with the full
    /// precedence chain and an empty context.
    pub fn client_features(&self, client_id: &str, now: DateTime<Utc>) -> BTreeSet<String> {
        let snapshot = match self.snapshot_for_evaluation(self.config.refresh_timeout) {
            Ok(snapshot) => snapshot,
            Err(_) => return BTreeSet::new(),
        };
        let evaluator = Evaluator::new(&snapshot, &self.config);
        let kill_switch = self.kill_switch_active();
        let context = EvaluationContext::empty();
        snapshot
            .feature_names()
            .into_iter()
            .filter(|name| {
                evaluator
                    .evaluate(kill_switch, client_id, name, &context, &now)
                    .enabled
            })
            .map(String::from)
            .collect()
    }

    /// The resolved features of `client_id` with active overrides applied, and where each value
    /// comes from. Rollout percentages are reported, not applied.
    pub fn resolve_client_features(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, ExplainedFeature>, ManagementError> {
        let snapshot = self.require_snapshot()?;
        let features = Evaluator::new(&snapshot, &self.config)
            .resolve_client_features(client_id, &now)?;
        Ok(features)
    }

    /// Assigns `user_id` to one of `groups` for the experiment `test_name`.
    pub fn assign_ab_group(&self, user_id: &str, test_name: &str, groups: &[String]) -> Option<String> {
        bucket::assign_ab_group(user_id, test_name, groups).map(String::from)
    }

    /// Schedules of `feature_name` by descending priority.
    pub fn schedules_for(&self, feature_name: &str) -> Vec<Schedule> {
        self.cache
            .current()
            .map(|s| s.schedules().schedules_for(feature_name).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active schedules starting within `hours` hours of `now`, earliest first.
    pub fn upcoming_schedules(&self, now: DateTime<Utc>, hours: i64) -> Vec<Schedule> {
        self.cache
            .current()
            .map(|s| s.schedules().upcoming_schedules(&now, hours).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn activate_kill_switch(&self, actor: Option<&str>) {
        self.set_kill_switch(true, actor);
    }

    pub fn deactivate_kill_switch(&self, actor: Option<&str>) {
        self.set_kill_switch(false, actor);
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    fn set_kill_switch(&self, active: bool, actor: Option<&str>) {
        let before = self.kill_switch.swap(active, Ordering::SeqCst);
        let actor = self.actor(actor);
        if active {
            warn!("kill switch activated by {}", actor);
        } else {
            info!("kill switch deactivated by {}", actor);
        }
        self.audit.record(AuditEvent {
            action: if active {
                AuditAction::Enable
            } else {
                AuditAction::Disable
            },
            entity_type: EntityType::System,
            entity_id: "kill_switch".to_owned(),
            before: Some(serde_json::json!({ "active": before })),
            after: Some(serde_json::json!({ "active": active })),
            actor,
            timestamp: self.clock.now(),
        });
    }

    pub(crate) fn actor(&self, actor: Option<&str>) -> String {
        actor.unwrap_or(&self.config.default_actor).to_owned()
    }

    /// Loads a fresh snapshot from the provider and swaps it in. On failure the previous
    /// snapshot stays in use.
    pub fn refresh(&self) -> Result<(), ProviderError> {
        load_into(self.provider.as_ref(), &self.cache, self.clock.as_ref()).map(|_| ())
    }

    /// True once a snapshot has been loaded.
    pub fn is_ready(&self) -> bool {
        self.cache.current().is_some()
    }

    pub fn snapshot_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.cache.age(now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.cache.is_stale(now)
    }

    /// The snapshot evaluations currently run against.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.cache.current()
    }

    pub(crate) fn require_snapshot(&self) -> Result<Arc<Snapshot>, ProviderError> {
        match self.cache.current() {
            Some(snapshot) => Ok(snapshot),
            None => self.forced_refresh(self.config.refresh_timeout),
        }
    }

    fn snapshot_for_evaluation(&self, timeout: Duration) -> Result<Arc<Snapshot>, ErrorKind> {
        if let Some(snapshot) = self.cache.current() {
            if self.cache.is_stale(self.clock.now()) {
                self.refresh_in_background();
            }
            return Ok(snapshot);
        }
        self.forced_refresh(timeout).map_err(|e| {
            warn!("no rule snapshot available: {}", e);
            match e {
                ProviderError::Timeout(_) => ErrorKind::NotReady,
                ref other => ErrorKind::from(other),
            }
        })
    }

    /// Waits up to `timeout` for a load to land a snapshot. A load that outlives the wait keeps
    /// running and still fills the cache when the provider answers.
    fn forced_refresh(&self, timeout: Duration) -> Result<Arc<Snapshot>, ProviderError> {
        let deadline = Instant::now().checked_add(timeout);
        let target = self.start_load()?;

        let mut state = self.loader.state.lock();
        while state.completed < target {
            match deadline {
                Some(deadline) => {
                    if self.loader.finished.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.loader.finished.wait(&mut state),
            }
        }
        if let Some(snapshot) = self.cache.current() {
            return Ok(snapshot);
        }
        if state.completed < target {
            return Err(ProviderError::Timeout(timeout));
        }
        Err(state.last_error.clone().unwrap_or_else(|| {
            ProviderError::Unavailable("snapshot loader stopped without an answer".into())
        }))
    }

    fn refresh_in_background(&self) {
        if let Err(e) = self.start_load() {
            warn!("could not start a snapshot refresh: {}", e);
        }
    }

    /// Starts a load on a helper thread unless one is already running. Returns the completion
    /// count at which the load the caller joined will have finished.
    fn start_load(&self) -> Result<u64, ProviderError> {
        let mut state = self.loader.state.lock();
        let target = state.completed + 1;
        if state.in_flight {
            return Ok(target);
        }
        state.in_flight = true;
        drop(state);

        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let clock = Arc::clone(&self.clock);
        let loader = Arc::clone(&self.loader);
        let spawned = thread::Builder::new()
            .name("ruleset-load".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    load_into(provider.as_ref(), &cache, clock.as_ref())
                }))
                .unwrap_or_else(|_| {
                    Err(ProviderError::Unavailable("rule provider panicked".into()))
                });
                let mut state = loader.state.lock();
                state.in_flight = false;
                state.completed += 1;
                state.last_error = result.err();
                loader.finished.notify_all();
            });
        if let Err(e) = spawned {
            self.loader.state.lock().in_flight = false;
            return Err(ProviderError::Unavailable(e.to_string()));
        }
        Ok(target)
    }

    /// Starts a thread refreshing the snapshot every `cache_ttl` until the returned handle is
    /// stopped or dropped, or the engine itself is dropped.
    pub fn spawn_refresher(self: &Arc<Self>) -> std::io::Result<RefresherHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let engine: Weak<Engine> = Arc::downgrade(self);
        let interval = self.config.cache_ttl;
        let thread = thread::Builder::new()
            .name("ruleset-refresher".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match engine.upgrade() {
                        Some(engine) => {
                            let _ = engine.refresh();
                        }
                        None => break,
                    },
                    _ => break,
                }
            })?;
        Ok(RefresherHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Stops the refresher started by [Engine::spawn_refresher] when dropped.
pub struct RefresherHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RefresherHandle {
    pub fn stop(self) {}
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("snapshot refresher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::context::ContextBuilder;
    use crate::snapshot::SnapshotDocument;
    use crate::test_common::{fixture_document, fixture_snapshot, CountingProvider, FailingProvider};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use test_case::test_case;

    fn time(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    // a Wednesday
    fn now() -> DateTime<Utc> {
        time("2025-03-05T12:00:00Z")
    }

    fn engine_for(snapshot: Snapshot) -> Engine {
        let engine = Engine::builder(Arc::new(snapshot))
            .clock(Arc::new(FixedClock::new(now())))
            .build();
        engine.refresh().unwrap();
        engine
    }

    fn engine() -> Engine {
        engine_for(fixture_snapshot())
    }

    fn engine_with(change: impl FnOnce(&mut SnapshotDocument)) -> Engine {
        let mut document = fixture_document();
        change(&mut document);
        engine_for(Snapshot::from_document(document).unwrap())
    }

    fn user(id: &str) -> EvaluationContext {
        ContextBuilder::new().user_id(id).build()
    }

    #[test]
    fn test_kill_switch_precedence() {
        let engine = engine();
        let baseline = fixture_snapshot().resolve_baseline().unwrap();
        let contexts = vec![
            EvaluationContext::empty(),
            ContextBuilder::new().user_id("u").set_string("country", "US").build(),
            ContextBuilder::new().set_string("plan", "gold").build(),
        ];

        engine.activate_kill_switch(None);
        for client in &["acme", "globex", "initech", "dormant", "any_client"] {
            for (name, feature) in &baseline {
                for context in &contexts {
                    let result = engine.evaluate_detailed(client, name, context, now());
                    assert_that!(result.enabled).is_equal_to(feature.enabled);
                    assert_that!(result.reason).is_equal_to(Reason::KillSwitch);
                    assert_that!(result.source).is_equal_to(Source::KillSwitch);
                }
            }
        }
    }

    #[test]
    fn kill_switch_restores_baseline_for_disabled_feature() {
        let engine = engine();
        assert!(!engine.evaluate("initech", "core_feature", &user("u"), now()));

        engine.activate_kill_switch(Some("oncall"));
        assert!(engine.evaluate("any_client", "core_feature", &user("u"), now()));
        assert!(engine.evaluate("initech", "core_feature", &user("u"), now()));

        engine.deactivate_kill_switch(Some("oncall"));
        assert!(!engine.evaluate("initech", "core_feature", &user("u"), now()));
    }

    #[test]
    fn kill_switch_toggles_are_audited() {
        let sink = Arc::new(InMemoryAuditSink::default());
        let engine = Engine::builder(Arc::new(fixture_snapshot()))
            .audit_sink(sink.clone())
            .clock(Arc::new(FixedClock::new(now())))
            .build();

        engine.activate_kill_switch(Some("oncall"));
        engine.deactivate_kill_switch(None);

        let events = sink.events_for(EntityType::System, "kill_switch");
        assert_that!(events).has_length(2);
        assert_eq!(events[0].action, AuditAction::Enable);
        assert_eq!(events[0].actor, "oncall");
        assert_eq!(events[0].after, Some(json!({"active": true})));
        assert_eq!(events[1].action, AuditAction::Disable);
        assert_eq!(events[1].actor, "system");
    }

    #[test]
    fn test_percentage_rollout_scoped_to_client() {
        let engine = engine();
        let enabled = (0..1000)
            .filter(|i| engine.evaluate("acme", "beta", &user(&i.to_string()), now()))
            .count();
        assert_that!(enabled).is_greater_than_or_equal_to(470);
        assert_that!(enabled).is_less_than_or_equal_to(530);
    }

    #[test]
    fn test_percentage_is_deterministic() {
        let engine = engine();
        for i in 0..200 {
            let context = user(&format!("user-{}", i));
            let first = engine.evaluate_detailed("acme", "beta", &context, now());
            let second = engine.evaluate_detailed("acme", "beta", &context, now());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_percentage_results() {
        let engine = engine();

        // "acme:user-2" lands in bucket 39, "acme:user-1" in bucket 69
        let admitted = engine.evaluate_detailed("acme", "beta", &user("user-2"), now());
        assert_that!(admitted).is_equal_to(EvaluationResult::new(
            true,
            Reason::RulesetEnabled,
            Source::Percentage,
        ));

        let excluded = engine.evaluate_detailed("acme", "beta", &user("user-1"), now());
        assert_that!(excluded).is_equal_to(EvaluationResult::new(
            false,
            Reason::PercentageRollout { percentage: 50 },
            Source::Percentage,
        ));
        assert_eq!(excluded.reason.to_string(), "percentage_rollout_50%");

        let anonymous = engine.evaluate_detailed("acme", "beta", &EvaluationContext::empty(), now());
        assert!(!anonymous.enabled);
        assert_that!(anonymous.reason).is_equal_to(Reason::PercentageRollout { percentage: 50 });
    }

    #[test]
    fn salt_mode_changes_buckets() {
        let engine = Engine::builder(Arc::new(fixture_snapshot()))
            .config(EngineConfig::default().with_salt_mode(SaltMode::User))
            .build();
        engine.refresh().unwrap();

        // "user-2" alone lands in bucket 55
        assert!(!engine.evaluate("acme", "beta", &user("user-2"), now()));
    }

    #[test]
    fn test_inheritance_override() {
        let resolved = fixture_snapshot().resolve("enterprise").unwrap();
        let enabled: BTreeMap<&str, bool> = resolved
            .iter()
            .filter(|(name, _)| ["A", "B", "C"].contains(&name.as_str()))
            .map(|(name, f)| (name.as_str(), f.enabled))
            .collect();
        assert_eq!(enabled, maplit::btreemap! { "A" => false, "B" => true, "C" => true });
    }

    #[test]
    fn test_override_expiry() {
        let engine = engine();

        let result = engine.evaluate_detailed("acme", "B", &user("u"), now());
        assert_that!(result).is_equal_to(EvaluationResult::new(
            false,
            Reason::FeatureNotInRuleset,
            Source::Baseline,
        ));

        let before_expiry = engine.evaluate_detailed("acme", "B", &user("u"), time("2019-06-01T00:00:00Z"));
        assert_that!(before_expiry).is_equal_to(EvaluationResult::new(
            true,
            Reason::ClientOverride,
            Source::Ruleset,
        ));
    }

    #[test]
    fn overrides_enable_or_defer_to_baseline() {
        let engine = engine();

        let trial = engine.evaluate_detailed("initech", "C", &user("u"), now());
        assert!(trial.enabled);
        assert_that!(trial.reason).is_equal_to(Reason::ClientOverride);

        // globex has B through pro
        let hold = engine.evaluate_detailed("globex", "B", &user("u"), now());
        assert_that!(hold).is_equal_to(EvaluationResult::new(
            false,
            Reason::ClientOverride,
            Source::Ruleset,
        ));
    }

    #[test]
    fn test_schedule_precedence_over_ruleset() {
        assert!(engine().evaluate("globex", "C", &user("u"), now()));

        let engine = engine_with(|document| {
            document.schedules.push(
                serde_json::from_value(json!({
                    "id": "freeze",
                    "featureName": "C",
                    "type": "date_range",
                    "startAt": (now() - chrono::Duration::hours(1)).to_rfc3339(),
                    "endAt": (now() + chrono::Duration::hours(1)).to_rfc3339(),
                    "enabledDuringSchedule": false
                }))
                .unwrap(),
            )
        });
        let result = engine.evaluate_detailed("globex", "C", &user("u"), now());
        assert_that!(result).is_equal_to(
            EvaluationResult::new(false, Reason::Schedule, Source::Schedule).matched("freeze"),
        );
    }

    #[test_case("2025-01-01T09:00:30Z", true, Reason::Schedule)]
    #[test_case("2025-01-01T09:02:00Z", false, Reason::FeatureNotInRuleset)]
    fn one_time_launch(at: &str, enabled: bool, reason: Reason) {
        let result = engine().evaluate_detailed("acme", "promo", &user("u"), time(at));
        assert_eq!(result.enabled, enabled);
        assert_eq!(result.reason, reason);
    }

    #[test]
    fn recurring_schedule_is_client_scoped() {
        let engine = engine();
        let saturday = time("2025-03-08T15:00:00Z");

        let acme = engine.evaluate_detailed("acme", "dark_mode", &user("u"), saturday);
        assert_that!(acme).is_equal_to(
            EvaluationResult::new(true, Reason::Schedule, Source::Schedule).matched("weekend_dark"),
        );
        assert!(!engine.evaluate("acme", "dark_mode", &user("u"), now()));
        assert!(!engine.evaluate("globex", "dark_mode", &user("u"), saturday));
    }

    #[test]
    fn test_targeting_priority_tie_break() {
        let engine = engine_with(|document| {
            document.targeting_rules.push(
                serde_json::from_str(
                    r#"{"id": "low", "featureName": "A", "priority": 5, "action": "disable"}"#,
                )
                .unwrap(),
            );
            document.targeting_rules.push(
                serde_json::from_str(
                    r#"{"id": "high", "featureName": "A", "priority": 10, "action": "enable"}"#,
                )
                .unwrap(),
            );
        });
        let result = engine.evaluate_detailed("globex", "A", &user("u"), now());
        assert_that!(result).is_equal_to(
            EvaluationResult::new(true, Reason::Targeting, Source::Targeting).matched("high"),
        );
    }

    #[test]
    fn test_error_containment() {
        let mut document = fixture_document();
        document.targeting_rules.push(
            serde_json::from_str(
                r#"{"id": "broken", "featureName": "C", "priority": 50, "action": "disable",
                    "conditions": [{"attribute": "email", "operator": "regex", "value": "(unclosed"}]}"#,
            )
            .unwrap(),
        );
        document.targeting_rules.push(
            serde_json::from_str(
                r#"{"id": "adults", "featureName": "C", "priority": 40, "action": "disable",
                    "conditions": [{"attribute": "age", "operator": "gte", "value": 18}]}"#,
            )
            .unwrap(),
        );
        document.targeting_rules.push(
            serde_json::from_str(
                r#"{"id": "staff", "featureName": "C", "priority": 10, "action": "disable",
                    "conditions": [{"attribute": "email", "operator": "ends_with", "value": "@globex.test"}]}"#,
            )
            .unwrap(),
        );
        let engine = engine_for(Snapshot::index(document));

        let visitor = ContextBuilder::new()
            .user_id("u")
            .set_string("email", "v@mail.test")
            .set_string("age", "unknown")
            .build();
        let result = engine.evaluate_detailed("globex", "C", &visitor, now());
        assert_that!(result).is_equal_to(EvaluationResult::new(
            true,
            Reason::RulesetEnabled,
            Source::Ruleset,
        ));

        let staff = ContextBuilder::new()
            .user_id("u")
            .set_string("email", "s@globex.test")
            .build();
        let result = engine.evaluate_detailed("globex", "C", &staff, now());
        assert_that!(result.matched_id).contains_value("staff".to_string());
        assert!(!result.enabled);
    }

    #[test_case("US", true, Reason::Targeting)]
    #[test_case("ca", true, Reason::Targeting)]
    #[test_case("DE", false, Reason::FeatureNotInRuleset)]
    fn country_targeting(country: &str, enabled: bool, reason: Reason) {
        let context = ContextBuilder::new()
            .user_id("u")
            .set_string("country", country)
            .build();
        let result = engine().evaluate_detailed("acme", "country_launch", &context, now());
        assert_eq!(result.enabled, enabled);
        assert_eq!(result.reason, reason);
    }

    #[test_case("nobody")]
    #[test_case("dormant")]
    fn unknown_or_inactive_clients_use_baseline(client: &str) {
        let engine = engine();
        let core = engine.evaluate_detailed(client, "core_feature", &user("u"), now());
        assert_that!(core).is_equal_to(EvaluationResult::new(
            true,
            Reason::ClientNotFound,
            Source::Baseline,
        ));
        assert!(!engine.evaluate(client, "C", &user("u"), now()));
    }

    #[test]
    fn unresolvable_ruleset_uses_baseline() {
        let mut document = fixture_document();
        if let Some(pro) = document.rulesets.iter_mut().find(|r| r.id == "pro") {
            pro.parent_id = Some("enterprise".into());
        }
        let engine = engine_for(Snapshot::index(document));
        let result = engine.evaluate_detailed("globex", "core_feature", &user("u"), now());
        assert_that!(result).is_equal_to(EvaluationResult::new(
            true,
            Reason::InvalidRuleset,
            Source::Baseline,
        ));
    }

    #[test]
    fn variants_come_from_variant_rules() {
        let engine = engine();
        let gold = ContextBuilder::new()
            .user_id("u")
            .set_string("plan", "gold")
            .build();

        assert_that!(engine.evaluate_variant("acme", "new_checkout", &gold))
            .contains_value(AttributeValue::from("express"));
        assert_that!(engine.evaluate_variant("acme", "new_checkout", &user("u"))).is_none();

        // a variant rule does not decide enablement
        let result = engine.evaluate_detailed("acme", "new_checkout", &gold, now());
        assert_that!(result).is_equal_to(EvaluationResult::new(
            true,
            Reason::RulesetEnabled,
            Source::Ruleset,
        ));

        engine.activate_kill_switch(None);
        assert_that!(engine.evaluate_variant("acme", "new_checkout", &gold)).is_none();
    }

    #[test]
    fn lists_client_features() {
        let engine = engine();
        let names = |client| -> Vec<String> { engine.client_features(client, now()).into_iter().collect() };

        assert_eq!(names("acme"), vec!["A", "core_feature", "new_checkout"]);
        assert_eq!(names("initech"), vec!["B", "C"]);
        assert_eq!(names("nobody"), vec!["A", "core_feature"]);
    }

    #[test]
    fn explains_client_features() {
        let features = engine().resolve_client_features("globex", now()).unwrap();

        assert_json_eq!(
            serde_json::to_value(&features).unwrap(),
            json!({
                "A": {"enabled": false, "percentage": 100, "source": "inherited", "sourceRulesetId": "pro"},
                "B": {
                    "enabled": false, "percentage": 100, "source": "override",
                    "overrideReason": "billing hold", "expiresAt": "2099-01-01T00:00:00Z"
                },
                "C": {"enabled": true, "percentage": 100, "source": "ruleset", "sourceRulesetId": "enterprise"},
                "core_feature": {"enabled": false, "percentage": 100, "source": "inherited", "sourceRulesetId": "pro"}
            })
        );

        assert_that!(engine().resolve_client_features("nobody", now())).is_err_containing(
            ManagementError::Configuration(ConfigurationError::UnknownClient("nobody".into())),
        );
    }

    #[test]
    fn reasons_serialize_like_detail_reasons() {
        assert_json_eq!(
            serde_json::to_value(EvaluationResult::error(ErrorKind::NotReady, false)).unwrap(),
            json!({
                "enabled": false,
                "reason": {"kind": "ERROR_FALLBACK", "errorKind": "NOT_READY"},
                "source": "error_fallback"
            })
        );
        assert_json_eq!(
            serde_json::to_value(
                EvaluationResult::new(false, Reason::PercentageRollout { percentage: 5 }, Source::Percentage)
            )
            .unwrap(),
            json!({
                "enabled": false,
                "reason": {"kind": "PERCENTAGE_ROLLOUT", "percentage": 5},
                "source": "percentage"
            })
        );
    }

    #[test_case(Reason::KillSwitch, "kill_switch")]
    #[test_case(Reason::ClientNotFound, "client_not_found")]
    #[test_case(Reason::InvalidRuleset, "invalid_ruleset")]
    #[test_case(Reason::Schedule, "schedule")]
    #[test_case(Reason::Targeting, "targeting")]
    #[test_case(Reason::ClientOverride, "client_override")]
    #[test_case(Reason::FeatureNotInRuleset, "feature_not_in_ruleset")]
    #[test_case(Reason::RulesetEnabled, "ruleset_enabled")]
    #[test_case(Reason::ErrorFallback { error_kind: ErrorKind::Internal }, "error_fallback")]
    fn reason_strings(reason: Reason, expected: &str) {
        assert_eq!(reason.to_string(), expected);
    }

    #[test]
    fn provider_failure_before_first_load() {
        let engine = Engine::builder(Arc::new(FailingProvider::unavailable())).build();
        let result = engine.evaluate_detailed("acme", "core_feature", &user("u"), now());
        assert_that!(result).is_equal_to(EvaluationResult::error(ErrorKind::Provider, false));
        assert!(!engine.is_ready());
        assert!(engine.client_features("acme", now()).is_empty());
    }

    #[test]
    fn slow_provider_before_first_load() {
        let engine = Engine::builder(Arc::new(FailingProvider::slow(Duration::from_millis(500)))).build();
        let result = engine.evaluate_detailed_with_timeout(
            "acme",
            "core_feature",
            &user("u"),
            now(),
            Duration::from_millis(10),
        );
        assert_that!(result).is_equal_to(EvaluationResult::error(ErrorKind::NotReady, false));
    }

    #[test]
    fn late_first_load_still_lands() {
        let loads = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider::slow(fixture_snapshot(), loads.clone(), Duration::from_millis(50));
        let engine = Engine::builder(Arc::new(provider)).build();
        let result = engine.evaluate_detailed_with_timeout(
            "acme",
            "core_feature",
            &user("u"),
            now(),
            Duration::from_millis(10),
        );
        assert_that!(result).is_equal_to(EvaluationResult::error(ErrorKind::NotReady, false));

        thread::sleep(Duration::from_millis(200));
        assert!(engine.is_ready());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(engine.evaluate("acme", "core_feature", &user("u"), now()));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_evaluations_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider::slow(fixture_snapshot(), loads.clone(), Duration::from_millis(50));
        let engine = Arc::new(Engine::builder(Arc::new(provider)).build());

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine.evaluate("acme", "core_feature", &user(&format!("user-{}", i)), now())
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_evaluation_loads_snapshot() {
        let engine = Engine::builder(Arc::new(fixture_snapshot())).build();
        assert!(!engine.is_ready());
        assert!(engine.evaluate("acme", "core_feature", &user("u"), now()));
        assert!(engine.is_ready());
    }

    #[test]
    fn stale_snapshot_is_still_used() {
        let clock = Arc::new(FixedClock::new(now()));
        let loads = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider::new(fixture_snapshot(), loads.clone());
        let engine = Engine::builder(Arc::new(provider))
            .clock(clock.clone())
            .build();
        engine.refresh().unwrap();
        assert!(!engine.is_stale(now()));

        clock.advance(chrono::Duration::seconds(31));
        assert!(engine.is_stale(clock.now()));
        assert!(engine.evaluate_now("acme", "core_feature", &user("u")));
        assert_that!(engine.snapshot_age(clock.now())).contains_value(chrono::Duration::seconds(31));

        // the background refresh runs on its own thread
        for _ in 0..100 {
            if loads.load(Ordering::SeqCst) >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_that!(loads.load(Ordering::SeqCst)).is_greater_than_or_equal_to(2);
    }

    #[test]
    fn refresher_reloads_until_stopped() {
        let loads = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(
            Engine::builder(Arc::new(CountingProvider::new(fixture_snapshot(), loads.clone())))
                .config(EngineConfig::default().with_cache_ttl(Duration::from_millis(10)))
                .build(),
        );
        let handle = engine.spawn_refresher().unwrap();
        thread::sleep(Duration::from_millis(200));
        handle.stop();

        let seen = loads.load(Ordering::SeqCst);
        assert_that!(seen).is_greater_than_or_equal_to(2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(loads.load(Ordering::SeqCst), seen);
        assert!(engine.is_ready());
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let provider = Arc::new(FailingProvider::after_first(fixture_snapshot()));
        let engine = Engine::builder(provider).build();
        engine.refresh().unwrap();
        assert_that!(engine.refresh()).is_err();
        assert!(engine.evaluate("acme", "core_feature", &user("u"), now()));
    }

    #[test]
    fn client_features_include_override_only_features() {
        let engine = engine_with(|d| {
            d.overrides.push(
                serde_json::from_value(json!({"clientId": "initech", "featureName": "Z", "enabled": true}))
                    .unwrap(),
            )
        });
        assert_that!(engine.client_features("initech", now())).contains("Z".to_string());
        assert_that!(engine.client_features("acme", now())).does_not_contain("Z".to_string());
    }

    #[test]
    fn client_features_include_schedule_only_features() {
        let engine = engine_with(|d| {
            d.schedules.push(
                serde_json::from_value(json!({
                    "id": "w_window", "featureName": "W", "type": "date_range",
                    "startAt": "2025-03-01T00:00:00Z", "endAt": "2025-03-10T00:00:00Z",
                    "enabledDuringSchedule": true
                }))
                .unwrap(),
            )
        });
        assert_that!(engine.client_features("globex", now())).contains("W".to_string());
        assert_that!(engine.client_features("globex", time("2025-03-11T00:00:00Z")))
            .does_not_contain("W".to_string());
    }

    #[test]
    fn client_features_include_targeting_only_features() {
        let engine = engine_with(|d| {
            d.targeting_rules.push(
                serde_json::from_value(json!({
                    "id": "everyone_v", "featureName": "V", "action": "enable"
                }))
                .unwrap(),
            )
        });
        assert_that!(engine.client_features("initech", now())).contains("V".to_string());
    }

    #[test]
    fn schedule_listings() {
        let engine = engine();
        let promo: Vec<String> = engine.schedules_for("promo").into_iter().map(|s| s.id).collect();
        assert_eq!(promo, vec!["launch", "retired"]);

        let upcoming: Vec<String> = engine
            .upcoming_schedules(time("2024-12-31T12:00:00Z"), 48)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(upcoming, vec!["launch"]);
    }

    #[test]
    fn assigns_ab_groups() {
        let groups = vec!["control".to_string(), "treatment".to_string()];
        assert_that!(engine().assign_ab_group("user-1", "checkout_test", &groups))
            .contains_value("control".to_string());
        assert_that!(engine().assign_ab_group("user-1", "checkout_test", &[])).is_none();
    }
}
