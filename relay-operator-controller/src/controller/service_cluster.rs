use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Client, Resource,
};
use std::sync::Arc;
use std::time::Duration;

use relay_operator_common::telemetry::{info, warn};

use crate::condition::{Condition, ConditionStatus, ConditionedStatus, READY, STATUS_UNKNOWN_REASON};
use crate::controller::context::Context;
use crate::controller::utils::{reset_backoff, update_status};
use crate::crd::v1alpha1::service_cluster::{ServiceCluster, ServiceClusterStatus};
use crate::error::{ControllerError, Result};

pub const CLUSTER_REACHABLE_REASON: &str = "ClusterReachable";
pub const CLUSTER_UNREACHABLE_REASON: &str = "ClusterUnreachable";

pub struct ServiceClusterController;

impl ServiceClusterController {
    /// Create a new controller for the ServiceCluster resource
    ///
    /// # Arguments
    /// * `client` - Client for the management cluster
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// The controller for the ServiceCluster resource
    pub fn create_controller(client: Client, ctx: &Context) -> Controller<ServiceCluster> {
        let config = &ctx.config().controller;
        let api = Api::<ServiceCluster>::namespaced(client, &config.provider_namespace);

        Controller::new(api, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(config.concurrency))
    }

    /// Probe the service cluster and record the outcome as a heartbeat
    ///
    /// # Arguments
    /// * `cluster` - The ServiceCluster resource to reconcile
    /// * `ctx` - The controller context
    ///
    /// # Returns
    /// An action to take after reconciling the ServiceCluster resource
    pub async fn reconcile(cluster: Arc<ServiceCluster>, ctx: Arc<Context>) -> Result<Action> {
        if cluster.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let action = heartbeat(&cluster, &ctx, Utc::now()).await?;
        reset_backoff(cluster.as_ref(), &ctx);
        Ok(action)
    }
}

async fn probe(cluster: &ServiceCluster, ctx: &Context) -> Result<String> {
    let namespace = cluster
        .namespace()
        .ok_or(ControllerError::MissingObjectKeyError(".metadata.namespace"))?;
    ctx.connector
        .connect(&namespace, &cluster.name_any())
        .await?
        .server_version()
        .await
}

/// Whether a heartbeat taken at `last` no longer vouches for the cluster at `now`
fn heartbeat_expired(last: Option<DateTime<Utc>>, now: DateTime<Utc>, grace: Duration) -> bool {
    let grace = ChronoDuration::from_std(grace).unwrap_or(ChronoDuration::MAX);
    match last {
        Some(last) => now.signed_duration_since(last) > grace,
        None => true,
    }
}

async fn heartbeat(cluster: &ServiceCluster, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let config = &ctx.config().controller;
    let mut status = cluster.status.clone().unwrap_or_default();
    status.observed_generation = cluster.meta().generation;

    match probe(cluster, ctx).await {
        Ok(version) => {
            status.kubernetes_version = Some(version);
            status.set_condition(
                Condition::ready(ConditionStatus::True, CLUSTER_REACHABLE_REASON, "The cluster answered the probe")
                    .with_heartbeat(now),
            );
            update_status(ctx.management.as_ref(), cluster, &status).await?;

            info!(
                event = "Reconciled",
                kind = "ServiceCluster",
                name = %cluster.name_any(),
                version = status.kubernetes_version.as_deref().unwrap_or_default(),
            );
            Ok(Action::requeue(Duration::from_secs(config.heartbeat_period_secs)))
        }
        Err(e) => {
            let last_heartbeat = status.condition(READY).and_then(|c| c.last_heartbeat_time);
            let grace = Duration::from_secs(config.unreachable_grace_secs);

            let condition = if heartbeat_expired(last_heartbeat, now, grace) {
                Condition::ready(ConditionStatus::Unknown, STATUS_UNKNOWN_REASON, e.to_string())
            } else {
                Condition::ready(ConditionStatus::False, CLUSTER_UNREACHABLE_REASON, e.to_string())
            };
            // The last heartbeat is kept so the grace window keeps counting from it
            let condition = match last_heartbeat {
                Some(at) => condition.with_heartbeat(at),
                None => condition,
            };
            status.set_condition(condition);
            update_status(ctx.management.as_ref(), cluster, &status).await?;

            warn!(
                event = "ServiceClusterUnreachable",
                name = %cluster.name_any(),
                phase = %status.phase,
                error = %e,
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Phase;
    use crate::testing::{TestEnv, PROVIDER_NAMESPACE, SERVICE_CLUSTER};
    use rstest::rstest;

    fn stored(env: &TestEnv) -> ServiceClusterStatus {
        env.management
            .typed::<ServiceCluster>(Some(PROVIDER_NAMESPACE), SERVICE_CLUSTER)
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    async fn seen_at(env: &TestEnv, at: DateTime<Utc>) -> ServiceCluster {
        let cluster = env.register_service_cluster(SERVICE_CLUSTER, &[]);
        heartbeat(&cluster, &env.ctx, at).await.unwrap();
        env.management
            .typed(Some(PROVIDER_NAMESPACE), SERVICE_CLUSTER)
            .unwrap()
    }

    #[tokio::test]
    async fn reachable_cluster_reports_version_and_heartbeat() {
        let env = TestEnv::new();
        let cluster = env.register_service_cluster(SERVICE_CLUSTER, &[]);

        let action = ServiceClusterController::reconcile(Arc::new(cluster), env.ctx.clone())
            .await
            .unwrap();

        let status = stored(&env);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.kubernetes_version.as_deref(), Some("v1.30.0"));
        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.reason, CLUSTER_REACHABLE_REASON);
        assert!(ready.last_heartbeat_time.is_some());
    }

    #[tokio::test]
    async fn unreachable_within_grace_is_not_ready() {
        let env = TestEnv::new();
        let now = Utc::now();
        let cluster = seen_at(&env, now - ChronoDuration::seconds(10)).await;
        env.service.set_unreachable(true);

        let result = heartbeat(&cluster, &env.ctx, now).await;

        assert!(matches!(result, Err(ControllerError::RemoteUnreachableError { .. })));
        let status = stored(&env);
        assert_eq!(status.phase, Phase::NotReady);
        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.reason, CLUSTER_UNREACHABLE_REASON);
        assert_eq!(ready.last_heartbeat_time, Some(now - ChronoDuration::seconds(10)));
    }

    #[tokio::test]
    async fn unreachable_past_grace_becomes_unknown() {
        let env = TestEnv::new();
        let now = Utc::now();
        let cluster = seen_at(&env, now - ChronoDuration::seconds(600)).await;
        env.service.set_unreachable(true);

        assert!(heartbeat(&cluster, &env.ctx, now).await.is_err());

        let status = stored(&env);
        assert_eq!(status.phase, Phase::Unreachable);
        assert_eq!(status.condition(READY).unwrap().status, ConditionStatus::Unknown);
        assert_eq!(status.kubernetes_version.as_deref(), Some("v1.30.0"));
    }

    #[tokio::test]
    async fn never_reached_cluster_is_unknown() {
        let env = TestEnv::new();
        let cluster = env.register_service_cluster("ap-south-1", &[]);

        let result = ServiceClusterController::reconcile(Arc::new(cluster), env.ctx.clone()).await;

        assert!(result.is_err());
        let status = env
            .management
            .typed::<ServiceCluster>(Some(PROVIDER_NAMESPACE), "ap-south-1")
            .and_then(|c| c.status)
            .unwrap();
        assert_eq!(status.phase, Phase::Unreachable);
        assert_eq!(status.condition(READY).unwrap().reason, STATUS_UNKNOWN_REASON);
    }

    #[rstest]
    #[case::fresh(Some(30), false)]
    #[case::at_the_edge(Some(120), false)]
    #[case::stale(Some(121), true)]
    #[case::never(None, true)]
    fn grace_window(#[case] age_secs: Option<i64>, #[case] expired: bool) {
        let now = Utc::now();
        let last = age_secs.map(|age| now - ChronoDuration::seconds(age));

        assert_eq!(heartbeat_expired(last, now, Duration::from_secs(120)), expired);
    }
}
