use async_trait::async_trait;
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
    Client, Resource,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_operator_common::telemetry::info;

use crate::cluster::registry::ClusterRegistry;
use crate::condition::{Condition, ConditionStatus, ConditionedStatus, TERMINATING_REASON};
use crate::controller::context::Context;
use crate::controller::object_mirror::{pending_sources, run_mirror_loop, MirrorTarget};
use crate::controller::utils::{reset_backoff, update_status, waiting};
use crate::crd::v1alpha1::object_mirror::ObjectMirror;
use crate::error::{ControllerError, Result};

pub static FINALIZER: &str = "objectmirrors.finalizers.relay.io";

pub const RUNNING_REASON: &str = "Running";
pub const MIRRORED_OBJECTS_PENDING_REASON: &str = "MirroredObjectsPending";

/// Launches mirror loops
#[async_trait]
pub trait MirrorRuntime: Send + Sync {
    /// Start a loop mirroring `target` that runs until `token` is cancelled
    async fn start(&self, target: MirrorTarget, token: CancellationToken) -> Result<JoinHandle<()>>;
}

/// Runs mirror loops as kube-rs controllers on tokio tasks
pub struct KubeMirrorRuntime {
    registry: Arc<ClusterRegistry>,
    ctx: Arc<Context>,
}

impl KubeMirrorRuntime {
    pub fn new(registry: Arc<ClusterRegistry>, ctx: Arc<Context>) -> Self {
        Self { registry, ctx }
    }
}

#[async_trait]
impl MirrorRuntime for KubeMirrorRuntime {
    async fn start(&self, target: MirrorTarget, token: CancellationToken) -> Result<JoinHandle<()>> {
        let service = self
            .registry
            .client_for(&target.provider_namespace, &target.service_cluster)
            .await?;
        let management = self.registry.management_client();

        Ok(tokio::spawn(run_mirror_loop(management, service, target, self.ctx.clone(), token)))
    }
}

struct RunningMirror {
    target: MirrorTarget,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningMirror {
    async fn stop(self) {
        self.token.cancel();
        // A loop that panicked is as stopped as one that returned
        let _ = self.handle.await;
    }
}

/// Mirror loops currently running, keyed by the ObjectMirror that asked for them
pub struct MirrorRegistry {
    runtime: Arc<dyn MirrorRuntime>,
    running: Mutex<HashMap<String, RunningMirror>>,
}

impl MirrorRegistry {
    pub fn new(runtime: Arc<dyn MirrorRuntime>) -> Self {
        Self { runtime, running: Mutex::new(HashMap::new()) }
    }

    /// Make sure a loop for `target` runs under `key`.
    ///
    /// A loop with a different target, or one that has exited, is stopped and
    /// replaced. Returns whether a loop was started.
    pub async fn ensure(&self, key: &str, target: MirrorTarget) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running
            .get(key)
            .is_some_and(|current| current.target == target && !current.handle.is_finished())
        {
            return Ok(false);
        }
        if let Some(previous) = running.remove(key) {
            info!(event = "StoppingMirror", key = key, reason = "TargetChanged");
            previous.stop().await;
        }

        let token = CancellationToken::new();
        let handle = self.runtime.start(target.clone(), token.clone()).await?;
        info!(
            event = "StartingMirror",
            key = key,
            source = target.source.kind.as_str(),
            cluster = target.service_cluster.as_str(),
        );
        running.insert(key.to_string(), RunningMirror { target, token, handle });
        Ok(true)
    }

    /// Stop the loop running under `key` and wait for it to exit. Returns
    /// whether a loop was running.
    pub async fn stop(&self, key: &str) -> bool {
        let removed = self.running.lock().await.remove(key);
        match removed {
            Some(mirror) => {
                info!(event = "StoppingMirror", key = key);
                mirror.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every loop, used on shutdown
    pub async fn stop_all(&self) {
        let drained: Vec<RunningMirror> = self.running.lock().await.drain().map(|(_, m)| m).collect();
        for mirror in drained {
            mirror.stop().await;
        }
    }

    /// Keys of the running loops, sorted
    pub async fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.running.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn mirror_key(mirror: &ObjectMirror) -> String {
    format!("{}/{}", mirror.namespace().unwrap_or_default(), mirror.name_any())
}

fn registry(ctx: &Context) -> Result<&MirrorRegistry> {
    ctx.mirrors
        .as_deref()
        .ok_or_else(|| ControllerError::UnknownError("no mirror registry configured".to_string()))
}

pub struct ObjectMirrorController;

impl ObjectMirrorController {
    /// Create a new controller for the ObjectMirror resource
    ///
    /// # Arguments
    /// * `client` - Client for the management cluster
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the ObjectMirror resource
    pub fn create_controller(client: Client, ctx: &Context) -> Controller<ObjectMirror> {
        let config = &ctx.config().controller;
        let api = Api::<ObjectMirror>::namespaced(client, &config.provider_namespace);

        Controller::new(api, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(config.concurrency))
    }

    /// Reconcile the ObjectMirror resource
    ///
    /// # Arguments
    /// * `mirror` - The ObjectMirror resource to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the ObjectMirror resource
    pub async fn reconcile(mirror: Arc<ObjectMirror>, ctx: Arc<Context>) -> Result<Action> {
        let namespace = mirror
            .namespace()
            .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
        let client = ctx
            .client
            .clone()
            .ok_or_else(|| ControllerError::UnknownError("no management client configured".to_string()))?;
        let api = Api::<ObjectMirror>::namespaced(client, &namespace);

        let action = finalizer(&api, FINALIZER, mirror.clone(), |event| async {
            match event {
                Finalizer::Apply(mirror) => apply_mirror(&mirror, &ctx).await,
                Finalizer::Cleanup(mirror) => cleanup_mirror(&mirror, &ctx).await,
            }
        })
        .await
        .map_err(|e| ControllerError::FinalizerError(e.to_string()))?;

        reset_backoff(mirror.as_ref(), &ctx);
        Ok(action)
    }
}

/// Start or retarget the loop for `mirror` and report it as running
pub async fn apply_mirror(mirror: &ObjectMirror, ctx: &Context) -> Result<Action> {
    let namespace = mirror
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let target = MirrorTarget::from_spec(&mirror.spec, &namespace);
    let mut status = mirror.status.clone().unwrap_or_default();
    status.observed_generation = mirror.meta().generation;

    match registry(ctx)?.ensure(&mirror_key(mirror), target).await {
        Ok(started) => {
            status.set_condition(Condition::ready(
                ConditionStatus::True,
                RUNNING_REASON,
                format!("Mirroring into ServiceCluster {}", mirror.spec.service_cluster.name),
            ));
            update_status(ctx.management.as_ref(), mirror, &status).await?;
            if started {
                info!(event = "Reconciled", kind = "ObjectMirror", name = %mirror.name_any(), started = true);
            }
            Ok(Action::requeue(ctx.state.resync_after()))
        }
        Err(e) => {
            status.set_condition(Condition::ready(ConditionStatus::False, e.reason(), e.to_string()));
            update_status(ctx.management.as_ref(), mirror, &status).await?;
            Err(e)
        }
    }
}

/// Stop the loop for `mirror` once no source object depends on it
pub async fn cleanup_mirror(mirror: &ObjectMirror, ctx: &Context) -> Result<Action> {
    let namespace = mirror
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    let target = MirrorTarget::from_spec(&mirror.spec, &namespace);
    let mut status = mirror.status.clone().unwrap_or_default();
    status.set_condition(Condition::ready(
        ConditionStatus::False,
        TERMINATING_REASON,
        "The mirror loop is being stopped",
    ));
    update_status(ctx.management.as_ref(), mirror, &status).await?;

    // Sources still holding the mirror finalizer are released by the loop alone
    let pending = pending_sources(ctx.management.as_ref(), &target).await?;
    if !pending.is_empty() {
        registry(ctx)?.ensure(&mirror_key(mirror), target).await?;
        return Ok(waiting(ctx, "ObjectMirror", &mirror.name_any(), MIRRORED_OBJECTS_PENDING_REASON));
    }

    registry(ctx)?.stop(&mirror_key(mirror)).await;
    info!(event = "Reconciled", kind = "ObjectMirror", name = %mirror.name_any(), deleted = true);
    Ok(Action::await_change())
}
