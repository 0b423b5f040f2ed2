// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

mod cli;

use std::sync::Arc;
use futures::StreamExt;
use std::process;
use std::fmt::Display;
use clap::Parser;
use clap::CommandFactory;
use kube::Client;
use rustls::crypto::aws_lc_rs;
use tokio_util::sync::CancellationToken;

use relay_operator_common::config::{AppConfig, AppConfigBuilder, LogConfig};
use relay_operator_common::state::State;
use relay_operator_common::telemetry::{error, info, setup_logging};
use relay_operator_controller::cluster::{
    client::KubeCluster,
    registry::{client_from_kubeconfig_file, ClusterRegistry, StaticConnector},
    ClusterApi,
};
use relay_operator_controller::controller::{
    context::Context,
    mirror_supervisor::{KubeMirrorRuntime, MirrorRegistry, ObjectMirrorController},
    namespace_mapping::NamespaceMappingController,
    object_mirror::{run_mirror_loop, MirrorTarget},
    schema_discovery::SchemaDiscoveryController,
    schema_discovery_set::SchemaDiscoverySetController,
    service_cluster::ServiceClusterController,
    utils::{create_k8s_client, error_policy},
};
use relay_operator_controller::crd::utils as crd_utils;
use relay_operator_controller::crd::v1alpha1::{
    namespace_mapping::NamespaceMapping,
    object_mirror::ObjectMirror,
    schema_discovery::SchemaDiscovery,
    schema_discovery_set::SchemaDiscoverySet,
    service_cluster::ServiceCluster,
};
use relay_operator_webhook::server::{create_router, create_tls_config, serve, shutdown_signal, Handle};

use crate::cli::{CliArgs, Commands};

/// Log `e` and exit, for failures that leave nothing to run
fn exit_with<E: Display>(e: E) -> ! {
    error!(
        event = "Error",
        error = %e,
    );
    process::exit(1);
}

fn load_config(path: Option<&str>) -> AppConfig {
    match AppConfigBuilder::default().with_optional_file(path).with_env().build() {
        Ok(config) => {
            setup_logging(&config.log);
            config
        }
        Err(e) => {
            setup_logging(&LogConfig::default());
            exit_with(e)
        }
    }
}

/// Context wired to the real management cluster and the ServiceCluster registry
fn management_context(client: &Client, state: Arc<State>, registry: Arc<ClusterRegistry>) -> Context {
    let management: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new("management", client.clone()));
    Context::new(management, registry)
        .with_state(state)
        .with_client(client.clone())
}

async fn run_controllers(config: AppConfig) {
    // Create necessary resources
    let state = Arc::new(State::new(config.clone()));
    let client = create_k8s_client().await.unwrap_or_else(|e| exit_with(e));
    let registry = Arc::new(ClusterRegistry::new(client.clone(), config.controller.kubeconfig_secret_key.clone()));

    // Mirror loops get a context without the registry of loops itself
    let base_ctx = management_context(&client, state.clone(), registry.clone());
    let runtime = Arc::new(KubeMirrorRuntime::new(registry.clone(), Arc::new(base_ctx.clone())));
    let mirrors = Arc::new(MirrorRegistry::new(runtime));
    let ctx = Arc::new(base_ctx.with_mirrors(mirrors.clone()));

    // Create CRD controllers
    let service_cluster_controller = ServiceClusterController::create_controller(client.clone(), &ctx).shutdown_on_signal();
    let namespace_mapping_controller = NamespaceMappingController::create_controller(client.clone(), &ctx).shutdown_on_signal();
    let schema_discovery_controller = SchemaDiscoveryController::create_controller(client.clone(), &ctx).shutdown_on_signal();
    let schema_discovery_set_controller = SchemaDiscoverySetController::create_controller(client.clone(), &ctx).shutdown_on_signal();
    let object_mirror_controller = ObjectMirrorController::create_controller(client.clone(), &ctx).shutdown_on_signal();

    // Run CRD controllers
    info!(event = "ControllerStarted", kind = "ServiceCluster", version = "v1alpha1");
    let service_cluster_ctx = ctx.clone();
    let service_cluster_handle = tokio::spawn(async move {
        service_cluster_controller.run(ServiceClusterController::reconcile, error_policy::<ServiceCluster>, service_cluster_ctx)
            .for_each(|r| async move {
                if let Err(e) = r {
                    error!(event = "ReconcileError", kind = "ServiceCluster", error = %e);
                }
            })
            .await
    });

    info!(event = "ControllerStarted", kind = "NamespaceMapping", version = "v1alpha1");
    let namespace_mapping_ctx = ctx.clone();
    let namespace_mapping_handle = tokio::spawn(async move {
        namespace_mapping_controller.run(NamespaceMappingController::reconcile, error_policy::<NamespaceMapping>, namespace_mapping_ctx)
            .for_each(|r| async move {
                if let Err(e) = r {
                    error!(event = "ReconcileError", kind = "NamespaceMapping", error = %e);
                }
            })
            .await
    });

    info!(event = "ControllerStarted", kind = "SchemaDiscovery", version = "v1alpha1");
    let schema_discovery_ctx = ctx.clone();
    let schema_discovery_handle = tokio::spawn(async move {
        schema_discovery_controller.run(SchemaDiscoveryController::reconcile, error_policy::<SchemaDiscovery>, schema_discovery_ctx)
            .for_each(|r| async move {
                if let Err(e) = r {
                    error!(event = "ReconcileError", kind = "SchemaDiscovery", error = %e);
                }
            })
            .await
    });

    info!(event = "ControllerStarted", kind = "SchemaDiscoverySet", version = "v1alpha1");
    let schema_discovery_set_ctx = ctx.clone();
    let schema_discovery_set_handle = tokio::spawn(async move {
        schema_discovery_set_controller.run(SchemaDiscoverySetController::reconcile, error_policy::<SchemaDiscoverySet>, schema_discovery_set_ctx)
            .for_each(|r| async move {
                if let Err(e) = r {
                    error!(event = "ReconcileError", kind = "SchemaDiscoverySet", error = %e);
                }
            })
            .await
    });

    info!(event = "ControllerStarted", kind = "ObjectMirror", version = "v1alpha1");
    let object_mirror_ctx = ctx.clone();
    let object_mirror_handle = tokio::spawn(async move {
        object_mirror_controller.run(ObjectMirrorController::reconcile, error_policy::<ObjectMirror>, object_mirror_ctx)
            .for_each(|r| async move {
                if let Err(e) = r {
                    error!(event = "ReconcileError", kind = "ObjectMirror", error = %e);
                }
            })
            .await
    });

    // Wait for all controllers to finish
    match tokio::try_join!(
        service_cluster_handle,
        namespace_mapping_handle,
        schema_discovery_handle,
        schema_discovery_set_handle,
        object_mirror_handle,
    ) {
        Ok(_) => info!(event = "Stopped"),
        Err(e) => error!(event = "Error", error = %e),
    }
    mirrors.stop_all().await;
}

async fn run_mirror(config: AppConfig) {
    let target = MirrorTarget::from_config(&config.mirror).unwrap_or_else(|e| exit_with(e));
    let state = Arc::new(State::new(config.clone()));
    let client = create_k8s_client().await.unwrap_or_else(|e| exit_with(e));
    let service = match &config.mirror.service_kubeconfig {
        Some(path) => client_from_kubeconfig_file(path).await.unwrap_or_else(|e| exit_with(e)),
        None => client.clone(),
    };

    let management: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new("management", client.clone()));
    let connector = Arc::new(StaticConnector::new(target.service_cluster.clone(), service.clone()));
    let ctx = Arc::new(
        Context::new(management, connector)
            .with_state(state)
            .with_client(client.clone()),
    );

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    run_mirror_loop(client, service, target, ctx, token).await;
}

async fn run_webhook(config: AppConfig) {
    // Create necessary resources
    let state = Arc::new(State::new(config.clone()));
    let client = create_k8s_client().await.unwrap_or_else(|e| exit_with(e));
    let registry = Arc::new(ClusterRegistry::new(client.clone(), config.controller.kubeconfig_secret_key.clone()));
    let ctx = Arc::new(management_context(&client, state, registry));

    let addr = format!("{}:{}", config.webhook.host, config.webhook.port);
    let tls_config = create_tls_config(config.webhook.tls.cert_file.to_string(), config.webhook.tls.key_file.to_string())
        .await
        .unwrap_or_else(|e| exit_with(e));
    let router = create_router(ctx);
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    // Run Webhook server
    info!(event = "Listening", address = addr.as_str());
    serve(addr, router, tls_config, handle).await.unwrap_or_else(|e| exit_with(e));
}

#[tokio::main]
async fn main() {
    // Install the default aws_lc_rs crypto provider
    let _ = aws_lc_rs::default_provider().install_default();

    let args = CliArgs::parse();

    match &args.cmd {
        Some(Commands::Crds) => {
            if let Err(e) = crd_utils::generate_crds() {
                eprintln!("{}", e);
                process::exit(1);
            }
        },
        Some(cmd) => {
            let config = load_config(args.config.as_deref());
            info!(
                event = "Starting",
                version = env!("CARGO_PKG_VERSION"),
                mode = ?cmd,
            );

            match cmd {
                Commands::Controller => run_controllers(config).await,
                Commands::Mirror => run_mirror(config).await,
                Commands::Webhook => run_webhook(config).await,
                Commands::Crds => {},
            }
        },
        None => {
            let mut cmd = CliArgs::command();
            let _ = cmd.print_help();
            process::exit(1);
        },
    }
}
