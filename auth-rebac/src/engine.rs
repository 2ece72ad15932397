use crate::{
    check::PermissionChecker,
    config::EngineConfig,
    consistency::{ConsistencyManager, SnapshotPin},
    error::{RebacError, Result},
    expand::SubjectExpander,
    models::*,
    registry::Registry,
    repository::{InMemoryTupleStore, RetryingStore, TupleStore},
    schema::SchemaDefinition,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{try_join_all, TryFutureExt};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Attempts for requests that read or write "at the latest snapshot" when
/// another engine's compaction overtakes the snapshot they picked
const STALE_SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CheckCacheKey {
    generation: u64,
    namespace: String,
    object: String,
    permission: String,
    subject: Subject,
    snapshot: SnapshotToken,
}

/// Registry a request evaluates against, captured when it starts
#[derive(Debug, Clone)]
struct ActiveRegistry {
    registry: Arc<Registry>,
    generation: u64,
}

/// Relationship-based authorization engine
///
/// Owns the tuple store, the active namespace registry and the snapshot
/// bookkeeping. Every read pins one snapshot for its whole evaluation, so
/// concurrent writes never produce read skew.
pub struct AuthorizationEngine {
    /// Storage for relation tuples
    store: Arc<dyn TupleStore>,

    /// Active namespace registry; replaced wholesale, never mutated
    registry: RwLock<ActiveRegistry>,

    /// Snapshot pins and compaction watermark
    consistency: Arc<ConsistencyManager>,

    /// Check results by request and snapshot
    cache: Option<Arc<DashMap<CheckCacheKey, bool>>>,

    config: EngineConfig,
}

impl AuthorizationEngine {
    /// Engine over `store` with the built-in role/permission model and
    /// default configuration
    pub fn new(store: Arc<dyn TupleStore>) -> Result<Self> {
        Self::with_config(store, Registry::builtin()?, EngineConfig::default())
    }

    /// Engine backed by a fresh in-memory store
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(InMemoryTupleStore::new()))
    }

    pub fn with_config(
        store: Arc<dyn TupleStore>,
        registry: Registry,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn TupleStore> = if config.storage_retry.max_attempts > 1 {
            Arc::new(RetryingStore::new(store, config.storage_retry.clone()))
        } else {
            store
        };

        let cache = config
            .cache_enabled
            .then(|| Arc::new(DashMap::with_capacity(config.cache_capacity.min(1024))));

        info!(
            max_depth = config.max_depth,
            request_timeout_ms = config.request_timeout_ms,
            cache_enabled = config.cache_enabled,
            "Authorization engine initialized"
        );

        Ok(Self {
            store,
            registry: RwLock::new(ActiveRegistry {
                registry: Arc::new(registry),
                generation: 0,
            }),
            consistency: Arc::new(ConsistencyManager::new()),
            cache,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TupleStore> {
        self.store.clone()
    }

    pub fn consistency(&self) -> &ConsistencyManager {
        &self.consistency
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.read().registry.clone()
    }

    // =============================================================================
    // Schema Management
    // =============================================================================

    /// Compile `definition` and make it the active registry
    #[instrument(skip(self, definition), fields(namespaces = definition.namespaces.len()))]
    pub fn load_schema(&self, definition: SchemaDefinition) -> Result<Arc<Registry>> {
        let registry = Registry::load(definition)?;
        self.swap_registry(registry);
        Ok(self.registry())
    }

    /// Atomically replace the active registry, returning the previous one.
    ///
    /// Requests already running keep the registry they started with.
    pub fn swap_registry(&self, registry: Registry) -> Arc<Registry> {
        let previous = {
            let mut active = self.registry.write();
            let generation = active.generation + 1;
            std::mem::replace(
                &mut *active,
                ActiveRegistry {
                    registry: Arc::new(registry),
                    generation,
                },
            )
        };

        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!(generation = previous.generation + 1, "Namespace registry swapped");
        previous.registry
    }

    fn active_registry(&self) -> ActiveRegistry {
        self.registry.read().clone()
    }

    // =============================================================================
    // Writes
    // =============================================================================

    /// Start a transaction based on the latest snapshot
    pub async fn transaction(&self) -> Result<WriteTransaction> {
        Ok(WriteTransaction::new(self.store.latest().await?))
    }

    /// Validate and commit a transaction atomically
    #[instrument(skip(self, transaction), fields(base = %transaction.base, ops = transaction.ops.len()))]
    pub async fn commit(&self, transaction: WriteTransaction) -> Result<WriteResponse> {
        let registry = self.registry();
        for op in &transaction.ops {
            if op.action == TupleAction::Insert {
                registry.validate_tuple(&op.tuple)?;
            }
        }

        let snapshot = match self.store.commit(transaction).await {
            Ok(snapshot) => snapshot,
            Err(e @ RebacError::Conflict { .. }) => {
                warn!(error = %e, "Write conflict");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!(snapshot = %snapshot, "Relation tuples committed");
        Ok(WriteResponse {
            snapshot,
            committed_at: Utc::now(),
        })
    }

    /// Apply a batch of tuple operations atop the latest snapshot
    pub async fn write_relation_tuples(&self, ops: Vec<TupleOp>) -> Result<WriteResponse> {
        let mut attempt = 1;
        loop {
            let mut transaction = self.transaction().await?;
            transaction.ops = ops.clone();
            match self.commit(transaction).await {
                Err(RebacError::SnapshotExpired { requested, watermark })
                    if attempt < STALE_SNAPSHOT_ATTEMPTS =>
                {
                    debug!(%requested, %watermark, attempt, "Base compacted before commit, rebasing");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub async fn write_tuple(&self, tuple: RelationTuple) -> Result<WriteResponse> {
        self.write_relation_tuples(vec![TupleOp::insert(tuple)]).await
    }

    pub async fn delete_tuple(&self, tuple: RelationTuple) -> Result<WriteResponse> {
        self.write_relation_tuples(vec![TupleOp::delete(tuple)]).await
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check whether the request's subject holds its permission.
    ///
    /// Evaluated at the requested snapshot, or the latest one when absent.
    /// Exceeding the deadline yields [`RebacError::Timeout`]; in-flight
    /// lookups are dropped with it.
    #[instrument(
        skip(self, request),
        fields(
            namespace = %request.namespace,
            permission = %request.permission,
            subject = %request.subject.redacted()
        )
    )]
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        let timeout = request.timeout;
        self.with_deadline(timeout, self.check_inner(request)).await
    }

    async fn check_inner(&self, request: CheckRequest) -> Result<CheckResponse> {
        let active = self.active_registry();
        let generation = active.generation;
        let checker = PermissionChecker::new(
            self.store.clone(),
            active.registry,
            self.config.max_depth,
        );
        let checker = &checker;
        let request = &request;

        self.pinned(request.snapshot, move |snapshot| {
            let key = CheckCacheKey {
                generation,
                namespace: request.namespace.clone(),
                object: request.object.clone(),
                permission: request.permission.clone(),
                subject: request.subject.clone(),
                snapshot,
            };
            self.cached_check(checker, key)
        })
        .await
    }

    async fn cached_check(
        &self,
        checker: &PermissionChecker,
        key: CheckCacheKey,
    ) -> Result<CheckResponse> {
        let snapshot = key.snapshot;
        if let Some(cache) = &self.cache {
            if let Some(allowed) = cache.get(&key) {
                debug!(snapshot = %snapshot, "Check cache hit");
                return Ok(CheckResponse {
                    allowed: *allowed,
                    snapshot,
                });
            }
        }

        let allowed = checker
            .check(&key.namespace, &key.object, &key.permission, &key.subject, key.snapshot)
            .await?;
        debug!(allowed, snapshot = %key.snapshot, "Check completed");

        if let Some(cache) = &self.cache {
            if cache.len() >= self.config.cache_capacity {
                debug!(capacity = self.config.cache_capacity, "Check cache full, clearing");
                cache.clear();
            }
            cache.insert(key, allowed);
        }
        Ok(CheckResponse { allowed, snapshot })
    }

    /// Run several checks concurrently; the first error fails the batch
    pub async fn batch_check(&self, requests: Vec<CheckRequest>) -> Result<Vec<CheckResponse>> {
        try_join_all(requests.into_iter().map(|request| self.check(request))).await
    }

    /// Expand a relation or permission into its subject tree
    #[instrument(skip(self, request), fields(namespace = %request.namespace, relation = %request.relation))]
    pub async fn expand(&self, request: ExpandRequest) -> Result<ExpandResponse> {
        let timeout = request.timeout;
        self.with_deadline(timeout, async {
            let expander = &self.expander_for(&request);
            let root = &request.root();
            self.pinned(request.snapshot, move |snapshot| {
                expander
                    .expand(root.clone(), snapshot)
                    .map_ok(move |tree| ExpandResponse { tree, snapshot })
            })
            .await
        })
        .await
    }

    /// Concrete subjects holding a relation or permission, sorted
    #[instrument(skip(self, request), fields(namespace = %request.namespace, relation = %request.relation))]
    pub async fn expand_subjects(&self, request: ExpandRequest) -> Result<SubjectsResponse> {
        let timeout = request.timeout;
        self.with_deadline(timeout, async {
            let expander = &self.expander_for(&request);
            let root = &request.root();
            self.pinned(request.snapshot, move |snapshot| {
                expander
                    .expand_subjects(root.clone(), snapshot)
                    .map_ok(move |found| {
                        let mut subjects: Vec<Subject> = found.into_iter().collect();
                        subjects.sort();
                        SubjectsResponse { subjects, snapshot }
                    })
            })
            .await
        })
        .await
    }

    fn expander_for(&self, request: &ExpandRequest) -> SubjectExpander {
        let active = self.active_registry();
        let max_depth = request.max_depth.unwrap_or(self.config.max_depth);
        SubjectExpander::new(self.store.clone(), active.registry, max_depth)
    }

    // =============================================================================
    // Relationship Queries
    // =============================================================================

    /// Stored tuples matching a partial filter
    pub async fn read_tuples(
        &self,
        query: TupleQuery,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<RelationTuple>> {
        let query = &query;
        self.pinned(snapshot, move |snapshot| self.store.read_tuples(query, snapshot))
            .await
    }

    /// Direct relations of `subject` within `namespace`, e.g. the roles of a user
    pub async fn subject_relations(
        &self,
        namespace: &str,
        subject: Subject,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<RelationTuple>> {
        self.read_tuples(TupleQuery::namespace(namespace).with_subject(subject), snapshot)
            .await
    }

    /// Objects of `namespace` on which `subject` holds `permission`.
    ///
    /// Candidates are the objects with stored tuples in the namespace; each
    /// is confirmed by a check at the same snapshot.
    #[instrument(skip(self, subject), fields(subject = %subject.redacted()))]
    pub async fn list_objects(
        &self,
        namespace: &str,
        permission: &str,
        subject: Subject,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<String>> {
        let active = self.active_registry();
        active.registry.resolve_rule(namespace, permission)?;

        let checker = PermissionChecker::new(
            self.store.clone(),
            active.registry,
            self.config.max_depth,
        );
        let checker = &checker;
        let subject = &subject;

        self.pinned(snapshot, move |snapshot| {
            Self::objects_with_permission(
                self.store.as_ref(),
                checker,
                namespace,
                permission,
                subject,
                snapshot,
            )
        })
        .await
    }

    async fn objects_with_permission(
        store: &dyn TupleStore,
        checker: &PermissionChecker,
        namespace: &str,
        permission: &str,
        subject: &Subject,
        snapshot: SnapshotToken,
    ) -> Result<Vec<String>> {
        let candidates: BTreeSet<String> = store
            .read_tuples(&TupleQuery::namespace(namespace), snapshot)
            .await?
            .into_iter()
            .map(|tuple| tuple.object)
            .collect();

        let results = try_join_all(candidates.iter().map(|object| async move {
            checker
                .check(namespace, object, permission, subject, snapshot)
                .await
                .map(|allowed| allowed.then(|| object.clone()))
        }))
        .await?;

        Ok(results.into_iter().flatten().collect())
    }

    pub async fn latest_snapshot(&self) -> Result<SnapshotToken> {
        self.store.latest().await
    }

    // =============================================================================
    // Maintenance
    // =============================================================================

    /// Advance the snapshot watermark and drop tuple versions no admissible
    /// snapshot can observe.
    ///
    /// The watermark is published through the store, so other engines on the
    /// same store reject the expired snapshots too. Their in-flight pins are
    /// not visible here; their reads fail with `SnapshotExpired` instead of
    /// observing a compacted snapshot.
    #[instrument(skip(self))]
    pub async fn compact(&self) -> Result<CompactionReport> {
        let range = self.store.snapshot_range().await?;
        let target = self
            .consistency
            .advance_watermark(range, self.config.retained_versions);
        let report = self.store.compact(target).await?;
        self.consistency.observe_watermark(report.watermark);

        if let Some(cache) = &self.cache {
            cache.clear();
        }

        info!(watermark = %report.watermark, removed = report.removed, "Compaction finished");
        Ok(report)
    }

    // =============================================================================
    // Helper Methods
    // =============================================================================

    async fn pin(&self, requested: Option<SnapshotToken>) -> Result<SnapshotPin> {
        let range = self.store.snapshot_range().await?;
        self.consistency.pin(requested, range)
    }

    /// Run `read` at a pinned snapshot.
    ///
    /// A request without a snapshot whose pinned head is compacted away by
    /// another engine mid-read starts over at the new head.
    async fn pinned<T, F, Fut>(&self, requested: Option<SnapshotToken>, read: F) -> Result<T>
    where
        F: Fn(SnapshotToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let pin = self.pin(requested).await?;
            match read(pin.token()).await {
                Err(RebacError::SnapshotExpired {
                    requested: expired,
                    watermark,
                }) if requested.is_none() && attempt < STALE_SNAPSHOT_ATTEMPTS => {
                    debug!(%expired, %watermark, attempt, "Snapshot compacted during read, retrying at head");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        timeout: Option<Duration>,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = timeout.unwrap_or_else(|| self.config.request_timeout());
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms, "Request deadline exceeded");
                Err(RebacError::Timeout { timeout_ms })
            }
        }
    }
}
