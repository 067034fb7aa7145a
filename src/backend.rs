//! Backend that reconciles a service against a cloud load balancer.
//!
//! The same implementation serves every bound backend version, each
//! with its own API endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Pod, Service, ServicePort},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::{
    config::LoadBalancerOptions,
    consts,
    credentials::{CloudCredential, CredentialCache},
    error::{HwLBError, HwLBResult},
    kube_client::KubeClient,
    lb_config::{self, AutoCreateSpec, ConfigDefaults, HealthMonitor, LoadBalancerConfig},
    node_filter,
    router::{BackendVersion, LoadBalancerBackend},
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloudLoadBalancer {
    pub id: String,
    #[serde(default)]
    pub vip_address: String,
    #[serde(default)]
    pub public_ips: Vec<String>,
}

impl CloudLoadBalancer {
    /// Public addresses come first, the private VIP is used otherwise.
    #[must_use]
    pub fn status(&self) -> LoadBalancerStatus {
        let ips = if self.public_ips.is_empty() {
            std::iter::once(&self.vip_address)
                .filter(|ip| !ip.is_empty())
                .collect::<Vec<_>>()
        } else {
            self.public_ips.iter().collect()
        };
        LoadBalancerStatus {
            ingress: Some(
                ips.into_iter()
                    .map(|ip| LoadBalancerIngress {
                        ip: Some(ip.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandwidthSpec {
    pub name: String,
    pub size: u32,
    pub share_type: String,
    pub charge_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub tenant_id: String,
    pub region: String,
    pub vpc_id: String,
    pub subnet_id: String,
    /// `public` or `inner`.
    pub network_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthSpec>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub eip_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eip_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionPersistenceSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthMonitorSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub delay: u32,
    pub timeout: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_port: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSpec {
    pub address: String,
    pub protocol_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSpec {
    pub name: String,
    pub lb_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistenceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_monitor: Option<HealthMonitorSpec>,
    pub members: Vec<MemberSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerSpec {
    pub name: String,
    pub description: String,
    pub protocol: String,
    pub protocol_port: i32,
    pub pool: PoolSpec,
}

/// Calls to the cloud load balancer API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn get_load_balancer(
        &self,
        credential: &CloudCredential,
        id: &str,
    ) -> HwLBResult<Option<CloudLoadBalancer>>;

    async fn create_load_balancer(
        &self,
        credential: &CloudCredential,
        request: &CreateLoadBalancerRequest,
    ) -> HwLBResult<CloudLoadBalancer>;

    /// Make the listeners owned by `owner` match `listeners` exactly.
    async fn sync_listeners(
        &self,
        credential: &CloudCredential,
        lb_id: &str,
        owner: &str,
        listeners: &[ListenerSpec],
    ) -> HwLBResult<()>;

    /// Remove the listeners owned by `owner`, including the one named `legacy_name`.
    async fn delete_listeners(
        &self,
        credential: &CloudCredential,
        lb_id: &str,
        owner: &str,
        legacy_name: &str,
    ) -> HwLBResult<()>;

    async fn delete_load_balancer(&self, credential: &CloudCredential, id: &str) -> HwLBResult<()>;
}

#[derive(Deserialize)]
struct LoadBalancerEnvelope {
    loadbalancer: CloudLoadBalancer,
}

/// Minimal JSON client behind the [`CloudApi`] boundary.
///
/// It is a placeholder for the vendor clients: paths follow the
/// project-scoped `loadbalancers` layout, but the listener sync and delete
/// calls are not real cloud endpoints. Only token authentication is done,
/// AK/SK signing and `signerType` are not supported.
pub struct RestCloudApi {
    http: reqwest::Client,
    base_url: String,
}

impl RestCloudApi {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: &str, project_id: &str, resource: &str) -> Self {
        Self {
            http,
            base_url: format!(
                "{}/v2/{}/{}",
                endpoint.trim_end_matches('/'),
                project_id,
                resource
            ),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        credential: &CloudCredential,
    ) -> HwLBResult<reqwest::RequestBuilder> {
        if credential.credential.is_empty() {
            return Err(HwLBError::CloudError(
                "credential secret carries no security token".to_string(),
            ));
        }
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Auth-Token", credential.credential.as_str()))
    }
}

#[async_trait]
impl CloudApi for RestCloudApi {
    async fn get_load_balancer(
        &self,
        credential: &CloudCredential,
        id: &str,
    ) -> HwLBResult<Option<CloudLoadBalancer>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{id}"), credential)?
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: LoadBalancerEnvelope = response.error_for_status()?.json().await?;
        Ok(Some(envelope.loadbalancer))
    }

    async fn create_load_balancer(
        &self,
        credential: &CloudCredential,
        request: &CreateLoadBalancerRequest,
    ) -> HwLBResult<CloudLoadBalancer> {
        let envelope: LoadBalancerEnvelope = self
            .request(reqwest::Method::POST, "", credential)?
            .json(&json!({ "loadbalancer": request }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.loadbalancer)
    }

    async fn sync_listeners(
        &self,
        credential: &CloudCredential,
        lb_id: &str,
        owner: &str,
        listeners: &[ListenerSpec],
    ) -> HwLBResult<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/{lb_id}/listeners"),
            credential,
        )?
        .query(&[("owner", owner)])
        .json(&json!({ "listeners": listeners }))
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn delete_listeners(
        &self,
        credential: &CloudCredential,
        lb_id: &str,
        owner: &str,
        legacy_name: &str,
    ) -> HwLBResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/{lb_id}/listeners"),
                credential,
            )?
            .query(&[("owner", owner), ("legacy_name", legacy_name)])
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, credential: &CloudCredential, id: &str) -> HwLBResult<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/{id}"), credential)?
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        Ok(())
    }
}

/// Load balancer backend driving one cloud API endpoint.
pub struct CloudBackend {
    version: BackendVersion,
    api: Arc<dyn CloudApi>,
    kube: Arc<dyn KubeClient>,
    credentials: Arc<CredentialCache>,
    defaults: ConfigDefaults,
    options: LoadBalancerOptions,
    cluster_id: String,
}

impl CloudBackend {
    #[must_use]
    pub fn new(
        version: BackendVersion,
        api: Arc<dyn CloudApi>,
        kube: Arc<dyn KubeClient>,
        credentials: Arc<CredentialCache>,
        defaults: ConfigDefaults,
        options: LoadBalancerOptions,
        cluster_id: String,
    ) -> Self {
        Self {
            version,
            api,
            kube,
            credentials,
            defaults,
            options,
            cluster_id,
        }
    }

    /// Decoded credentials for the namespace of the service.
    fn credential(&self, svc: &Service) -> HwLBResult<CloudCredential> {
        let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
        let secret_name = self.credentials.secret_name();
        let mut credential = self
            .credentials
            .get(&namespace, secret_name)
            .ok_or_else(|| HwLBError::MissingCredential(format!("{namespace}/{secret_name}")))?;
        credential.decode()?;
        Ok(credential)
    }

    fn bound_id(svc: &Service) -> Option<&str> {
        svc.annotations()
            .get(consts::ELB_ID_ANN_NAME)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    async fn create(
        &self,
        svc: &Service,
        spec: &AutoCreateSpec,
        config: &LoadBalancerConfig,
        credential: &CloudCredential,
    ) -> HwLBResult<CloudLoadBalancer> {
        let name = if spec.name.is_empty() {
            node_filter::load_balancer_name(svc)
        } else {
            spec.name.clone()
        };
        let bandwidth = (spec.is_public() && config.eip_id.is_none()).then(|| BandwidthSpec {
            name: spec.bandwidth_name.clone(),
            size: spec.bandwidth_size.unwrap_or_default(),
            share_type: spec.bandwidth_sharetype.clone(),
            charge_mode: spec.bandwidth_chargemode.clone(),
        });
        let request = CreateLoadBalancerRequest {
            name,
            tenant_id: self.options.tenant_id.clone(),
            region: self.options.region.clone(),
            vpc_id: self.options.vpc_id.clone(),
            subnet_id: self.options.subnet_id.clone(),
            network_type: spec.network_type.clone(),
            bandwidth,
            eip_type: spec.eip_type.clone(),
            eip_id: config.eip_id.clone(),
        };
        tracing::info!("Creating {} load balancer {}", self.version, request.name);
        let created = self.api.create_load_balancer(credential, &request).await?;

        // Bind the service to the new balancer, so it is reused from now on.
        self.kube
            .patch_service_metadata(
                &svc.namespace().unwrap_or_default(),
                &svc.name_any(),
                &json!({
                    "annotations": {
                        consts::ELB_ID_ANN_NAME: created.id,
                    }
                }),
            )
            .await?;
        Ok(created)
    }

    /// Find the balancer of the service, creating it if the service asks for it.
    async fn get_or_create(
        &self,
        svc: &Service,
        config: &LoadBalancerConfig,
        credential: &CloudCredential,
    ) -> HwLBResult<CloudLoadBalancer> {
        let Some(id) = Self::bound_id(svc) else {
            let Some(spec) = config.auto_create.as_ref() else {
                return Err(HwLBError::invalid_annotation(
                    consts::ELB_ID_ANN_NAME,
                    "",
                    "load balancer id or auto-create specification is required",
                ));
            };
            return self.create(svc, spec, config, credential).await;
        };
        if let Some(balancer) = self.api.get_load_balancer(credential, id).await? {
            return Ok(balancer);
        }
        let persisted_spec = svc
            .annotations()
            .get(consts::ELB_AUTOCREATE_ANN_NAME)
            .filter(|raw| !raw.is_empty() && config.persist_auto_create);
        match persisted_spec {
            Some(raw) => {
                tracing::warn!("Load balancer {} is gone, creating it again", id);
                let spec = lb_config::parse_auto_create(raw)?;
                self.create(svc, &spec, config, credential).await
            }
            None => Err(HwLBError::LoadBalancerNotFound(id.to_string())),
        }
    }

    async fn target_pods(&self, svc: &Service) -> HwLBResult<Vec<Pod>> {
        let Some(selector) = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .filter(|selector| !selector.is_empty())
        else {
            return Ok(vec![]);
        };
        let label_selector = selector
            .iter()
            .map(|(key, val)| format!("{key}={val}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods = self
            .kube
            .list_pods(&svc.namespace().unwrap_or_default(), &label_selector)
            .await?;
        Ok(pods
            .into_iter()
            .filter(node_filter::is_pod_active)
            .collect())
    }

    fn members(
        port: &ServicePort,
        host_network: bool,
        nodes: &[Node],
        pods: &[Pod],
    ) -> Vec<MemberSpec> {
        if host_network {
            let target_port = match port.target_port {
                Some(IntOrString::Int(target)) => target,
                _ => port.port,
            };
            return pods
                .iter()
                .filter_map(|pod| pod.status.as_ref()?.pod_ip.clone())
                .map(|address| MemberSpec {
                    address,
                    protocol_port: target_port,
                })
                .collect();
        }
        let Some(node_port) = port.node_port else {
            tracing::warn!("Node port is not set for port {}. Skipping...", port.port);
            return vec![];
        };
        nodes
            .iter()
            .filter(|node| node_filter::is_node_eligible(node))
            .filter_map(|node| node_filter::node_address(node, "InternalIP"))
            .map(|address| MemberSpec {
                address: address.to_string(),
                protocol_port: node_port,
            })
            .collect()
    }

    fn health_monitor(
        svc: &Service,
        monitor: &HealthMonitor,
        port_protocol: &str,
        host_network: bool,
    ) -> HealthMonitorSpec {
        let protocol = monitor.protocol_for(port_protocol);
        let monitor_port = monitor.check_port.map(i32::from).or_else(|| {
            let healthz = node_filter::health_check_port(svc)?;
            if host_network {
                match healthz.target_port {
                    Some(IntOrString::Int(target)) => Some(target),
                    _ => Some(healthz.port),
                }
            } else {
                healthz.node_port
            }
        });
        HealthMonitorSpec {
            type_: protocol.as_str().to_string(),
            delay: monitor.delay,
            timeout: monitor.timeout,
            max_retries: monitor.max_retries,
            url_path: (protocol == lb_config::HealthCheckProtocol::Http)
                .then(|| monitor.url_path.clone()),
            monitor_port,
        }
    }

    /// Desired listeners of the service, one per TCP or UDP port.
    fn listeners(
        &self,
        svc: &Service,
        config: &LoadBalancerConfig,
        nodes: &[Node],
        pods: &[Pod],
    ) -> Vec<ListenerSpec> {
        let description = node_filter::listener_description(&self.cluster_id, svc);
        let session_persistence =
            config
                .session_affinity
                .persistence_type()
                .map(|type_| SessionPersistenceSpec {
                    type_: type_.to_string(),
                    persistence_timeout: match config.session_affinity {
                        lb_config::SessionAffinity::ClientIp {
                            persistence_timeout,
                        } => Some(persistence_timeout),
                        _ => None,
                    },
                    cookie_name: match &config.session_affinity {
                        lb_config::SessionAffinity::Cookie { cookie_name } => cookie_name.clone(),
                        _ => None,
                    },
                });

        svc.spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
            .filter(|port| port.name.as_deref() != Some(consts::HEALTHZ_PORT_NAME))
            .filter_map(|port| {
                let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
                if protocol != "TCP" && protocol != "UDP" {
                    tracing::warn!("Protocol {} is not supported. Skipping...", protocol);
                    return None;
                }
                let health_monitor = config.health_check.enabled.then(|| {
                    Self::health_monitor(
                        svc,
                        &config.health_check.monitor,
                        &protocol,
                        config.host_network,
                    )
                });
                Some(ListenerSpec {
                    name: node_filter::listener_name(port),
                    description: description.clone(),
                    protocol_port: port.port,
                    pool: PoolSpec {
                        name: node_filter::pool_name(svc, port),
                        lb_algorithm: config.algorithm.as_str().to_string(),
                        session_persistence: session_persistence.clone(),
                        health_monitor,
                        members: Self::members(port, config.host_network, nodes, pods),
                    },
                    protocol,
                })
            })
            .collect()
    }

    async fn sync(
        &self,
        svc: &Service,
        config: &LoadBalancerConfig,
        nodes: &[Node],
        credential: &CloudCredential,
        balancer: &CloudLoadBalancer,
    ) -> HwLBResult<()> {
        let pods = if config.host_network {
            self.target_pods(svc).await?
        } else {
            vec![]
        };
        let listeners = self.listeners(svc, config, nodes, &pods);
        tracing::info!(
            "Syncing {} listeners of load balancer {}",
            listeners.len(),
            balancer.id
        );
        self.api
            .sync_listeners(
                credential,
                &balancer.id,
                &svc.uid().unwrap_or_default(),
                &listeners,
            )
            .await
    }
}

#[async_trait]
impl LoadBalancerBackend for CloudBackend {
    #[tracing::instrument(skip_all, fields(version = %self.version, service = svc.name_any()))]
    async fn get(&self, svc: &Service) -> HwLBResult<Option<LoadBalancerStatus>> {
        let Some(id) = Self::bound_id(svc) else {
            return Ok(None);
        };
        let credential = self.credential(svc)?;
        let balancer = self.api.get_load_balancer(&credential, id).await?;
        Ok(balancer.map(|balancer| balancer.status()))
    }

    #[tracing::instrument(skip_all, fields(version = %self.version, service = svc.name_any()))]
    async fn ensure(&self, svc: &Service, nodes: &[Node]) -> HwLBResult<LoadBalancerStatus> {
        let config = LoadBalancerConfig::try_from_svc(svc, &self.defaults)?;
        let credential = self.credential(svc)?;
        let balancer = self.get_or_create(svc, &config, &credential).await?;
        self.sync(svc, &config, nodes, &credential, &balancer)
            .await?;
        Ok(balancer.status())
    }

    #[tracing::instrument(skip_all, fields(version = %self.version, service = svc.name_any()))]
    async fn update(&self, svc: &Service, nodes: &[Node]) -> HwLBResult<()> {
        let config = LoadBalancerConfig::try_from_svc(svc, &self.defaults)?;
        let Some(id) = Self::bound_id(svc) else {
            return Err(HwLBError::invalid_annotation(
                consts::ELB_ID_ANN_NAME,
                "",
                "service is not bound to a load balancer",
            ));
        };
        let credential = self.credential(svc)?;
        let balancer = self
            .api
            .get_load_balancer(&credential, id)
            .await?
            .ok_or_else(|| HwLBError::LoadBalancerNotFound(id.to_string()))?;
        self.sync(svc, &config, nodes, &credential, &balancer).await
    }

    #[tracing::instrument(skip_all, fields(version = %self.version, service = svc.name_any()))]
    async fn ensure_deleted(&self, svc: &Service) -> HwLBResult<()> {
        let Some(id) = Self::bound_id(svc) else {
            return Ok(());
        };
        // The secret may go first, e.g. when the whole namespace is deleted.
        // Nothing can be released without it and the service must not get stuck.
        let credential = match self.credential(svc) {
            Ok(credential) => credential,
            Err(HwLBError::MissingCredential(key)) => {
                tracing::warn!(
                    "Credential secret {} is gone, load balancer {} is left behind",
                    key,
                    id
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        tracing::info!("Deleting listeners of load balancer {}", id);
        self.api
            .delete_listeners(
                &credential,
                id,
                &svc.uid().unwrap_or_default(),
                &node_filter::legacy_listener_name(svc),
            )
            .await?;
        if lb_config::has_auto_created(svc.annotations()) {
            tracing::info!("Deleting auto-created load balancer {}", id);
            self.api.delete_load_balancer(&credential, id).await?;
        }
        Ok(())
    }
}
