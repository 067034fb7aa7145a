#![warn(
    // Base lints.
    clippy::all,
    // Some pedantic lints.
    clippy::pedantic,
    // New lints which are cool.
    clippy::nursery,
)]
#![
    allow(
        // Types are named after their module on purpose.
        clippy::module_name_repetitions,
        clippy::missing_errors_doc
    )
]

use backend::{CloudBackend, RestCloudApi};
use clap::Parser;
use config::{CloudConfig, OperatorConfig};
use credentials::CredentialCache;
use error::{HwLBError, HwLBResult};
use events::{EventPublisher, KubeEventPublisher};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use kube_client::{KubeApiClient, KubeClient};
use lb_config::ConfigDefaults;
use router::{BackendVersion, VersionRouter};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub mod backend;
pub mod config;
pub mod consts;
pub mod credentials;
pub mod error;
pub mod events;
pub mod finalizers;
pub mod kube_client;
pub mod lb_config;
pub mod marker;
pub mod node_filter;
pub mod router;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> HwLBResult<()> {
    dotenvy::dotenv().ok();
    let operator_config = OperatorConfig::parse();
    tracing_subscriber::fmt()
        .with_max_level(operator_config.log_level)
        .init();

    tracing::info!("Starting hwcloud-lb operator v{}", env!("CARGO_PKG_VERSION"));
    let cloud_config = CloudConfig::from_file(&operator_config.cloud_config)?;
    cloud_config.log();
    let lb_options = cloud_config.load_balancer;
    let defaults = ConfigDefaults::with_algorithm(&lb_options.elb_algorithm)?;

    let kube_client = kube::Client::try_default().await?;
    tracing::info!("Kube client is connected");
    let kube: Arc<dyn KubeClient> = Arc::new(KubeApiClient::new(kube_client.clone()));

    let credentials = Arc::new(CredentialCache::new(&lb_options.secret_name));
    let (secret_tx, secret_rx) = mpsc::channel(operator_config.secret_queue_size);
    tokio::spawn(credentials::watch_secrets(
        kube_client.clone(),
        lb_options.secret_name.clone(),
        secret_tx,
    ));
    tokio::spawn(credentials.clone().consume(secret_rx));

    let http = reqwest::Client::new();
    let mut router = VersionRouter::new();
    // Performance balancers have no backend yet, their services are left alone.
    for (version, endpoint, resource) in [
        (BackendVersion::Elb, &lb_options.elb_endpoint, "elb/loadbalancers"),
        (BackendVersion::Alb, &lb_options.alb_endpoint, "elb/loadbalancers"),
        (BackendVersion::Nat, &lb_options.nat_endpoint, "nat_gateways"),
    ] {
        if endpoint.is_empty() {
            tracing::warn!("No endpoint is configured for {} load balancers", version);
            continue;
        }
        let api = Arc::new(RestCloudApi::new(
            http.clone(),
            endpoint,
            &lb_options.tenant_id,
            resource,
        ));
        router = router.bind(
            version,
            Arc::new(CloudBackend::new(
                version,
                api,
                kube.clone(),
                credentials.clone(),
                defaults.clone(),
                lb_options.clone(),
                operator_config.cluster_id.clone(),
            )),
        );
    }

    let context = Arc::new(CurrentContext::new(
        kube,
        Arc::new(KubeEventPublisher::new(kube_client.clone())),
        router,
        operator_config,
    ));
    tracing::info!("Starting the controller");
    Controller::new(
        kube::Api::<Service>::all(kube_client),
        watcher::Config::default(),
    )
    .run(reconcile_service, on_error, context)
    .for_each(|reconcilation_result| async move {
        match reconcilation_result {
            Ok((service, _action)) => {
                tracing::info!("Reconcilation of a service {} was successful", service.name);
            }
            Err(err) => match err {
                // During reconcilation process,
                // the controller has decided to skip the service.
                kube::runtime::controller::Error::ReconcilerFailed(HwLBError::SkipService, _) => {}
                _ => {
                    tracing::error!("Error reconciling service: {:#?}", err);
                }
            },
        }
    })
    .await;
    Ok(())
}

#[derive(Clone)]
pub struct CurrentContext {
    pub kube: Arc<dyn KubeClient>,
    pub events: Arc<dyn EventPublisher>,
    pub router: VersionRouter,
    pub config: OperatorConfig,
}

impl CurrentContext {
    #[must_use]
    pub fn new(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        router: VersionRouter,
        config: OperatorConfig,
    ) -> Self {
        Self {
            kube,
            events,
            router,
            config,
        }
    }
}

/// Reconcile the service.
/// This function is called by the controller for each service.
/// It will create or update the load balancer based on the service.
/// If the service is being deleted, it will release the load balancer.
#[tracing::instrument(skip(svc,context), fields(service=svc.name_any()))]
pub async fn reconcile_service(
    svc: Arc<Service>,
    context: Arc<CurrentContext>,
) -> HwLBResult<Action> {
    let version = router::route(&svc);

    // Services that were deleted or stopped being load balancers
    // release what they still hold.
    let released =
        svc.meta().deletion_timestamp.is_some() || matches!(version, Ok(BackendVersion::NoneNeeded));
    if released {
        if !finalizers::check(&svc) {
            return Err(HwLBError::SkipService);
        }
        tracing::info!("Releasing the load balancer of the service");
        context.router.ensure_released(&svc).await?;
        finalizers::remove(context.kube.as_ref(), &svc).await?;
        return Ok(Action::await_change());
    }

    tracing::info!("Starting service reconcilation");
    match reconcile_load_balancer(&svc, &context).await {
        Ok(action) => {
            marker::clear_marker(context.kube.as_ref(), &svc, false).await;
            Ok(action)
        }
        Err(err) => {
            tracing::warn!("Load balancer configuration failed: {}", err);
            marker::mark_failure(context.kube.as_ref(), context.events.as_ref(), &svc).await;
            Err(err)
        }
    }
}

/// Reconcile the `LoadBalancer` type of service.
/// Services that already have an address are updated in place,
/// the others get their load balancer ensured.
pub async fn reconcile_load_balancer(
    svc: &Service,
    context: &CurrentContext,
) -> HwLBResult<Action> {
    // Services with an unknown class never hold the finalizer.
    router::route(svc)?;
    finalizers::add(context.kube.as_ref(), svc).await?;
    let nodes = context.kube.list_nodes().await?;

    let current_status = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.clone());
    let has_ingress = current_status
        .as_ref()
        .and_then(|status| status.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty());

    if has_ingress && svc.annotations().contains_key(consts::ELB_ID_ANN_NAME) {
        context.router.update(svc, &nodes).await?;
    } else if let Some(status) = context.router.ensure(svc, &nodes).await? {
        if current_status.as_ref() != Some(&status) {
            context
                .kube
                .patch_service_status(
                    &svc.namespace().unwrap_or_default(),
                    &svc.name_any(),
                    &status,
                )
                .await?;
        }
    }

    Ok(Action::requeue(Duration::from_secs(
        context.config.requeue_interval,
    )))
}

/// Handle the error during reconcilation.
#[allow(clippy::needless_pass_by_value)]
fn on_error(_: Arc<Service>, error: &HwLBError, context: Arc<CurrentContext>) -> Action {
    match error {
        HwLBError::SkipService => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(
            context.config.error_requeue_interval,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::MockEventPublisher, kube_client::MockKubeClient,
        router::MockLoadBalancerBackend,
    };
    use k8s_openapi::{
        api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
        chrono::Utc,
    };
    use std::{collections::BTreeMap, path::PathBuf};
    use tracing::level_filters::LevelFilter;

    fn operator_config() -> OperatorConfig {
        OperatorConfig {
            cloud_config: PathBuf::from("/etc/cloud.json"),
            cluster_id: "cluster-1".to_string(),
            requeue_interval: 30,
            error_requeue_interval: 5,
            secret_queue_size: 8,
            log_level: LevelFilter::INFO,
        }
    }

    fn context(
        kube: MockKubeClient,
        events: MockEventPublisher,
        router: VersionRouter,
    ) -> Arc<CurrentContext> {
        Arc::new(CurrentContext::new(
            Arc::new(kube),
            Arc::new(events),
            router,
            operator_config(),
        ))
    }

    fn status(ip: &str) -> LoadBalancerStatus {
        LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            }]),
        }
    }

    fn service(svc_type: &str, annotations: &[(&str, &str)], finalizers: &[&str]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                finalizers: Some(finalizers.iter().map(ToString::to_string).collect()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(svc_type.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ensures_and_publishes_status() {
        let mut backend = MockLoadBalancerBackend::new();
        backend
            .expect_ensure()
            .times(1)
            .returning(|_, _| Ok(status("100.1.1.1")));
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        kube.expect_patch_service_status()
            .withf(|_, name, lb_status| name == "web" && *lb_status == status("100.1.1.1"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_service_metadata()
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_replace_service().never();
        let router = VersionRouter::new().bind(BackendVersion::Alb, Arc::new(backend));
        let ctx = context(kube, MockEventPublisher::new(), router);

        let action = reconcile_service(Arc::new(service("LoadBalancer", &[], &[])), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn bound_service_with_address_is_updated() {
        let mut backend = MockLoadBalancerBackend::new();
        backend.expect_ensure().never();
        backend.expect_update().times(1).returning(|_, _| Ok(()));
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        kube.expect_patch_service_status().never();
        // The marker is cleared after a successful update.
        kube.expect_replace_service()
            .withf(|svc| !svc.annotations().contains_key(consts::ELB_MARK_ANN_NAME))
            .times(1)
            .returning(|svc| Ok(svc.clone()));
        let router = VersionRouter::new().bind(BackendVersion::Elb, Arc::new(backend));
        let ctx = context(kube, MockEventPublisher::new(), router);

        let mut svc = service(
            "LoadBalancer",
            &[
                (consts::ELB_CLASS_ANN_NAME, "elasticity"),
                (consts::ELB_ID_ANN_NAME, "lb-1"),
                (consts::ELB_MARK_ANN_NAME, "2"),
            ],
            &[consts::FINALIZER_NAME],
        );
        svc.status = Some(ServiceStatus {
            load_balancer: Some(status("100.1.1.1")),
            ..Default::default()
        });
        reconcile_service(Arc::new(svc), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn failure_is_marked_and_returned() {
        let mut backend = MockLoadBalancerBackend::new();
        backend
            .expect_ensure()
            .returning(|_, _| Err(HwLBError::CloudError("quota exceeded".to_string())));
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        kube.expect_replace_service()
            .withf(|svc| {
                svc.annotations().get(consts::ELB_MARK_ANN_NAME).map(String::as_str) == Some("1")
            })
            .times(1)
            .returning(|svc| Ok(svc.clone()));
        let router = VersionRouter::new().bind(BackendVersion::Alb, Arc::new(backend));
        let ctx = context(kube, MockEventPublisher::new(), router);

        let svc = service("LoadBalancer", &[], &[consts::FINALIZER_NAME]);
        let err = reconcile_service(Arc::new(svc), ctx).await.unwrap_err();
        assert!(matches!(err, HwLBError::CloudError(_)));
    }

    #[tokio::test]
    async fn unsupported_class_is_marked() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        kube.expect_replace_service()
            .times(1)
            .returning(|svc| Ok(svc.clone()));
        let ctx = context(kube, MockEventPublisher::new(), VersionRouter::new());

        let svc = service(
            "LoadBalancer",
            &[(consts::ELB_CLASS_ANN_NAME, "bogus")],
            &[consts::FINALIZER_NAME],
        );
        let err = reconcile_service(Arc::new(svc), ctx).await.unwrap_err();
        assert!(matches!(err, HwLBError::UnsupportedClass(_)));
    }

    #[tokio::test]
    async fn deleted_service_releases_balancer() {
        let mut backend = MockLoadBalancerBackend::new();
        backend.expect_ensure_deleted().times(1).returning(|_| Ok(()));
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata()
            .withf(|_, _, metadata| *metadata == serde_json::json!({ "finalizers": [] }))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let router = VersionRouter::new().bind(BackendVersion::Alb, Arc::new(backend));
        let ctx = context(kube, MockEventPublisher::new(), router);

        let mut svc = service("LoadBalancer", &[], &[consts::FINALIZER_NAME]);
        svc.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let action = reconcile_service(Arc::new(svc), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unknown_class_gets_no_finalizer() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata().never();
        kube.expect_list_nodes().never();
        kube.expect_replace_service()
            .times(1)
            .returning(|svc| Ok(svc.clone()));
        let ctx = context(kube, MockEventPublisher::new(), VersionRouter::new());

        let svc = service("LoadBalancer", &[(consts::ELB_CLASS_ANN_NAME, "bogus")], &[]);
        let err = reconcile_service(Arc::new(svc), ctx).await.unwrap_err();
        assert!(matches!(err, HwLBError::UnsupportedClass(_)));
    }

    #[tokio::test]
    async fn deleted_service_with_unknown_class_drops_finalizer() {
        let mut alb = MockLoadBalancerBackend::new();
        alb.expect_ensure_deleted().never();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata()
            .withf(|_, _, metadata| *metadata == serde_json::json!({ "finalizers": [] }))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let router = VersionRouter::new().bind(BackendVersion::Alb, Arc::new(alb));
        let ctx = context(kube, MockEventPublisher::new(), router);

        let mut svc = service(
            "LoadBalancer",
            &[(consts::ELB_CLASS_ANN_NAME, "bogus")],
            &[consts::FINALIZER_NAME],
        );
        svc.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let action = reconcile_service(Arc::new(svc), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn other_services_are_skipped() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_nodes().never();
        let ctx = context(kube, MockEventPublisher::new(), VersionRouter::new());
        let err = reconcile_service(Arc::new(service("ClusterIP", &[], &[])), ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, HwLBError::SkipService));
        assert_eq!(
            on_error(Arc::new(Service::default()), &err, ctx.clone()),
            Action::await_change()
        );
        assert_eq!(
            on_error(
                Arc::new(Service::default()),
                &HwLBError::CloudError("boom".to_string()),
                ctx
            ),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
