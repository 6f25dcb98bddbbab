//! Cluster-wide service creation.
//!
//! ```text
//!   non-head ──NodeToHeadStartService──► head
//!                                         │ lock, finalize, select node
//!                     ┌───────────────────┴──────────────────┐
//!                     ▼ local                                 ▼ remote
//!             LocalService::new                HeadToNodeStartService ──► owner
//!             handle_register                  register remote provider
//!                                              FinishServiceRegistration ──► owner
//!                     │                  (no answer ──► AbortServiceRegistration)
//!                     └───────────────────┬──────────────────┘
//!                                         ▼
//!                     Created | Deferred (retry queued) | Failed
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use servgrid_cluster::{ClusterMessage, MembershipManager, OperationOutcome, Target};
use servgrid_placement::{node_candidates, select_node_for_service};
use servgrid_state::{
    GroupProvider, RetryConfiguration, ServiceConfiguration, ServiceConfigurationBuilder,
    ServiceCreateResult, ServiceInfoSnapshot,
};

use crate::context::ServiceContext;
use crate::events::NodeSelection;
use crate::retry::{RetryOutcomes, RetryQueue, RetryTracker, retry_delay};
use crate::service::LocalService;

/// A service instantiated for the head, waiting for
/// `FinishServiceRegistration`.
struct PendingService {
    service: Arc<LocalService>,
    accepted_at: Instant,
}

pub struct ServiceFactory {
    ctx: Arc<ServiceContext>,
    membership: Arc<MembershipManager>,
    groups: Arc<dyn GroupProvider>,
    creation_lock: Mutex<()>,
    /// Services created for the head, waiting for their registration to be
    /// finished.
    pending: DashMap<Uuid, PendingService>,
    retries: RetryQueue,
    outcomes: RetryOutcomes,
}

impl ServiceFactory {
    pub fn new(
        ctx: Arc<ServiceContext>,
        membership: Arc<MembershipManager>,
        groups: Arc<dyn GroupProvider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            let retries = RetryQueue::start(move |tracker| {
                let me = me.clone();
                async move {
                    if let Some(factory) = me.upgrade() {
                        factory.run_retry(tracker).await;
                    }
                }
            });
            Self {
                ctx,
                membership,
                groups,
                creation_lock: Mutex::new(()),
                pending: DashMap::new(),
                retries,
                outcomes: RetryOutcomes::default(),
            }
        })
    }

    /// Create a service somewhere in the cluster.
    pub async fn create_service(&self, configuration: &ServiceConfiguration) -> ServiceCreateResult {
        match self.membership.is_local_head() {
            Ok(true) => self.create_as_head(configuration).await,
            Ok(false) => self.forward_to_head(configuration).await,
            Err(e) => {
                warn!(error = %e, "cannot determine head node");
                ServiceCreateResult::Failed
            }
        }
    }

    /// Receiver for the terminal result of a deferred creation.
    pub fn watch_creation(&self, creation_id: Uuid) -> Option<watch::Receiver<Option<ServiceCreateResult>>> {
        self.outcomes.subscribe(creation_id)
    }

    async fn forward_to_head(&self, configuration: &ServiceConfiguration) -> ServiceCreateResult {
        let head = match self.membership.head_node() {
            Ok(Some(head)) => head,
            Ok(None) => {
                warn!("no head node known, cannot create service");
                return ServiceCreateResult::Failed;
            }
            Err(e) => {
                warn!(error = %e, "cannot determine head node");
                return ServiceCreateResult::Failed;
            }
        };
        debug!(task = %configuration.task_name(), head = %head.node_id(), "forwarding creation to head");

        let message = ClusterMessage::NodeToHeadStartService {
            configuration: configuration.clone(),
        };
        // The head may itself wait for a remote node.
        let timeout = self.ctx.config.start_timeout() * 2;
        match self
            .ctx
            .transport
            .send_query(Target::Node(head.node_id().to_string()), message, timeout)
            .await
        {
            Some(ClusterMessage::StartServiceResult { result }) => result,
            _ => {
                warn!(task = %configuration.task_name(), "head did not answer creation request");
                ServiceCreateResult::Failed
            }
        }
    }

    async fn create_as_head(&self, configuration: &ServiceConfiguration) -> ServiceCreateResult {
        let (result, finalized) = {
            let _guard = self.creation_lock.lock().await;
            match self.finalize(configuration) {
                Some(finalized) => (self.place(&finalized).await, Some(finalized)),
                None => (ServiceCreateResult::Failed, None),
            }
        };

        if result.is_created() {
            return result;
        }
        match finalized {
            Some(finalized) => self.schedule_retry(configuration, finalized),
            None => result,
        }
    }

    /// Hooks, unique ids, group components; retry disabled.
    fn finalize(&self, configuration: &ServiceConfiguration) -> Option<ServiceConfiguration> {
        let builder = self.ctx.events.configure(configuration.to_builder());
        let builder = self.assign_task_service_id(builder);
        let builder = self.assign_unique_id(builder);
        let builder = self.include_groups(builder);
        match builder.retry(RetryConfiguration::no_retry()).build() {
            Ok(finalized) => Some(finalized),
            Err(e) => {
                warn!(task = %configuration.task_name(), error = %e, "invalid service configuration");
                None
            }
        }
    }

    /// Smallest free id at or above the requested one within the task,
    /// counting local, remote and pending services.
    fn assign_task_service_id(&self, builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
        let configuration = builder.peek();
        let taken = self.task_service_ids(configuration.task_name());
        let mut id = configuration.service_id.task_service_id.max(1);
        while taken.contains(&id) {
            id += 1;
        }
        builder.task_service_id(id)
    }

    fn task_service_ids(&self, task: &str) -> BTreeSet<i32> {
        let mut taken: BTreeSet<i32> = self
            .ctx
            .registry
            .services_by_task(task)
            .iter()
            .map(|s| s.configuration.service_id.task_service_id)
            .collect();
        taken.extend(
            self.pending
                .iter()
                .map(|entry| entry.service.configuration())
                .filter(|c| c.task_name() == task)
                .map(|c| c.service_id.task_service_id),
        );
        taken
    }

    fn assign_unique_id(&self, builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
        let mut unique_id = builder.peek().service_id.unique_id;
        while self.ctx.registry.contains(unique_id) {
            unique_id = Uuid::new_v4();
        }
        builder.unique_id(unique_id)
    }

    /// Merge every group targeting the environment or named explicitly.
    fn include_groups(&self, mut builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
        let groups = match self.groups.groups() {
            Ok(groups) => groups,
            Err(e) => {
                warn!(error = %e, "cannot load groups");
                return builder;
            }
        };
        let environment = builder.peek().environment().to_string();
        let explicit = builder.peek().groups.clone();

        for group in groups
            .into_iter()
            .filter(|g| g.targets(&environment) || explicit.contains(&g.name))
        {
            builder = builder
                .groups([group.name])
                .templates(group.templates)
                .inclusions(group.inclusions)
                .deployments(group.deployments)
                .jvm_options(group.jvm_options)
                .process_parameters(group.process_parameters)
                .environment_variables(group.environment_variables);
        }
        builder
    }

    fn select_node(&self, configuration: &ServiceConfiguration) -> Option<String> {
        match self.ctx.events.select_node(configuration) {
            NodeSelection::Force(node) => return Some(node),
            NodeSelection::Cancel => {
                debug!(service = %configuration.name(), "placement cancelled by listener");
                return None;
            }
            NodeSelection::Default => {}
        }

        let nodes = match self.membership.placement_view() {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "cannot read cluster members");
                return None;
            }
        };
        let candidates = node_candidates(&nodes, &self.ctx.registry.services());
        match select_node_for_service(configuration, &candidates) {
            Ok(node) => Some(node),
            Err(e) => {
                info!(service = %configuration.name(), reason = %e, "no node for service");
                None
            }
        }
    }

    async fn place(&self, finalized: &ServiceConfiguration) -> ServiceCreateResult {
        let Some(node) = self.select_node(finalized) else {
            return ServiceCreateResult::Failed;
        };
        let mut configuration = finalized.clone();
        configuration.service_id.node_id = Some(node.clone());

        if node == self.ctx.node_id {
            self.create_local(configuration).await
        } else {
            self.create_remote(&node, configuration).await
        }
    }

    async fn create_local(&self, configuration: ServiceConfiguration) -> ServiceCreateResult {
        let service = LocalService::new(self.ctx.clone(), configuration);
        match service.handle_register().await {
            Some(snapshot) => ServiceCreateResult::created(snapshot),
            None => ServiceCreateResult::Failed,
        }
    }

    async fn create_remote(&self, node: &str, configuration: ServiceConfiguration) -> ServiceCreateResult {
        let timeout = self.ctx.config.start_timeout();
        let name = configuration.name();
        let unique_id = configuration.service_id.unique_id;
        let reply = self
            .ctx
            .transport
            .send_query(
                Target::Node(node.to_string()),
                ClusterMessage::HeadToNodeStartService { configuration },
                timeout,
            )
            .await;
        let snapshot = match reply {
            Some(ClusterMessage::StartServiceResult {
                result: ServiceCreateResult::Created { snapshot },
            }) => *snapshot,
            Some(_) => {
                warn!(service = %name, %node, "node refused service");
                return ServiceCreateResult::Failed;
            }
            None => {
                warn!(service = %name, %node, "node did not answer start request");
                self.abort_remote(node, unique_id).await;
                return ServiceCreateResult::Failed;
            }
        };

        if self.ctx.registry.register_remote(snapshot, node).is_none() {
            warn!(service = %name, %node, "service id already registered");
            self.abort_remote(node, unique_id).await;
            return ServiceCreateResult::Failed;
        }

        let reply = self
            .ctx
            .transport
            .send_query(
                Target::Node(node.to_string()),
                ClusterMessage::FinishServiceRegistration { unique_id },
                timeout,
            )
            .await;
        match reply {
            Some(ClusterMessage::OperationReply {
                outcome: OperationOutcome::Snapshot { snapshot: Some(snapshot) },
            }) => {
                self.ctx.registry.handle_service_update((*snapshot).clone(), node);
                info!(service = %name, %node, "service created on remote node");
                ServiceCreateResult::Created { snapshot }
            }
            _ => {
                warn!(service = %name, %node, "registration not finished by node");
                if self.abort_remote(node, unique_id).await {
                    self.ctx.registry.unregister(unique_id);
                } else {
                    // Owner state unknown: the provider keeps its ids taken
                    // until the owner reports DELETED or is lost.
                    warn!(service = %name, %node, "keeping unconfirmed remote service registered");
                }
                ServiceCreateResult::Failed
            }
        }
    }

    /// Ask `node` to drop `unique_id`. `true` once the node answered.
    async fn abort_remote(&self, node: &str, unique_id: Uuid) -> bool {
        let reply = self
            .ctx
            .transport
            .send_query(
                Target::Node(node.to_string()),
                ClusterMessage::AbortServiceRegistration { unique_id },
                self.ctx.config.start_timeout(),
            )
            .await;
        match reply {
            Some(ClusterMessage::OperationReply { .. }) => {
                debug!(id = %unique_id, %node, "remote creation aborted");
                true
            }
            _ => {
                warn!(id = %unique_id, %node, "node did not confirm abort");
                false
            }
        }
    }

    // ── Owner side of remote creation ──────────────────────────────

    /// How long an accepted service waits for its registration.
    pub fn pending_timeout(&self) -> Duration {
        self.ctx.config.start_timeout() * 2
    }

    /// Instantiate a configuration finalized by the head, without
    /// registering it yet. Refuses ids already used on this node.
    pub fn accept_remote(&self, configuration: ServiceConfiguration) -> ServiceCreateResult {
        self.expire_pending();
        let unique_id = configuration.service_id.unique_id;
        if self.ctx.registry.contains(unique_id) || self.pending.contains_key(&unique_id) {
            warn!(id = %unique_id, "refusing duplicate service id");
            return ServiceCreateResult::Failed;
        }
        let task_service_id = configuration.service_id.task_service_id;
        if self
            .task_service_ids(configuration.task_name())
            .contains(&task_service_id)
        {
            warn!(service = %configuration.name(), "refusing duplicate task service id");
            return ServiceCreateResult::Failed;
        }

        let service = LocalService::new(self.ctx.clone(), configuration);
        let snapshot = service.snapshot();
        self.pending.insert(
            unique_id,
            PendingService {
                service,
                accepted_at: Instant::now(),
            },
        );
        ServiceCreateResult::created(snapshot)
    }

    /// Register a pending service and move it to PREPARED.
    pub async fn finish_registration(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        let (_, pending) = self.pending.remove(&unique_id)?;
        pending.service.handle_register().await
    }

    /// Drop a service the head gave up on: pending ones are forgotten,
    /// registered ones deleted. `None` if this node does not know it.
    pub async fn abort_registration(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        if let Some((_, pending)) = self.pending.remove(&unique_id) {
            info!(service = %pending.service.name(), "pending service abandoned by head");
            return Some(pending.service.snapshot());
        }
        let service = self.ctx.registry.local_service(unique_id)?;
        info!(service = %service.name(), "registration aborted by head, deleting service");
        service.delete().await;
        Some(service.snapshot())
    }

    /// Forget pending services older than [`pending_timeout`](Self::pending_timeout).
    pub fn expire_pending(&self) -> usize {
        let timeout = self.pending_timeout();
        let before = self.pending.len();
        self.pending.retain(|id, pending| {
            let keep = pending.accepted_at.elapsed() < timeout;
            if !keep {
                warn!(%id, service = %pending.service.name(), "pending service expired");
            }
            keep
        });
        before.saturating_sub(self.pending.len())
    }

    // ── Retries ────────────────────────────────────────────────────

    fn schedule_retry(
        &self,
        original: &ServiceConfiguration,
        finalized: ServiceConfiguration,
    ) -> ServiceCreateResult {
        if !original.retry.enabled() {
            return ServiceCreateResult::Failed;
        }
        let tracker = RetryTracker {
            creation_id: Uuid::new_v4(),
            configuration: finalized,
            policy: original.retry.clone(),
            attempt: 0,
        };
        let creation_id = tracker.creation_id;
        info!(
            %creation_id,
            task = %original.task_name(),
            max_retries = tracker.policy.max_retries,
            "service creation deferred"
        );
        self.outcomes.open(creation_id);
        self.retries.schedule(tracker.clone(), retry_delay(&tracker.policy, 0));
        ServiceCreateResult::Deferred { creation_id }
    }

    async fn run_retry(&self, mut tracker: RetryTracker) {
        let result = self.create_service(&tracker.configuration).await;
        tracker.attempt += 1;

        if result.is_created() {
            info!(creation_id = %tracker.creation_id, attempt = tracker.attempt, "deferred creation succeeded");
            self.publish(&tracker, result).await;
        } else if tracker.exhausted() {
            warn!(creation_id = %tracker.creation_id, attempts = tracker.attempt, "deferred creation failed");
            self.publish(&tracker, ServiceCreateResult::Failed).await;
        } else {
            let delay = retry_delay(&tracker.policy, tracker.attempt);
            self.retries.schedule(tracker, delay);
        }
    }

    async fn publish(&self, tracker: &RetryTracker, result: ServiceCreateResult) {
        self.outcomes.publish(tracker.creation_id, result.clone());
        for (node, channels) in &tracker.policy.event_receivers {
            let channels: Vec<String> = channels.iter().cloned().collect();
            if *node == self.ctx.node_id {
                self.ctx
                    .events
                    .deferred_create_result(tracker.creation_id, &channels, &result);
                continue;
            }
            let message = ClusterMessage::DeferredCreateResult {
                creation_id: tracker.creation_id,
                channels: channels.into_iter().collect(),
                result: result.clone(),
            };
            if let Err(e) = self.ctx.transport.send(Target::Node(node.clone()), message).await {
                warn!(%node, error = %e, "deferred result not delivered");
            }
        }
    }
}
