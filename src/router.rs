//! Selection of the backend that owns a service.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::{
    consts,
    error::{HwLBError, HwLBResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendVersion {
    /// The service does not need a load balancer.
    NoneNeeded,
    Elb,
    Alb,
    Plb,
    Nat,
}

impl BackendVersion {
    /// Map the value of the class annotation to a version.
    pub fn from_class(class: &str) -> HwLBResult<Self> {
        match class {
            consts::CLASS_ELASTICITY => Ok(Self::Elb),
            consts::CLASS_UNION | "" => Ok(Self::Alb),
            consts::CLASS_PERFORMANCE => Ok(Self::Plb),
            consts::CLASS_DNAT => Ok(Self::Nat),
            other => Err(HwLBError::UnsupportedClass(other.to_string())),
        }
    }
}

impl std::fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoneNeeded => "none",
            Self::Elb => "ELB",
            Self::Alb => "ALB",
            Self::Plb => "PLB",
            Self::Nat => "NAT",
        };
        f.write_str(name)
    }
}

/// Pick the backend version for a service.
pub fn route(svc: &Service) -> HwLBResult<BackendVersion> {
    let svc_type = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .unwrap_or("ClusterIP");
    if svc_type != "LoadBalancer" {
        return Ok(BackendVersion::NoneNeeded);
    }
    let version = BackendVersion::from_class(class_of(svc))?;
    tracing::debug!("Load balancer version {} for service {}", version, svc.name_any());
    Ok(version)
}

fn class_of(svc: &Service) -> &str {
    svc.annotations()
        .get(consts::ELB_CLASS_ANN_NAME)
        .map(String::as_str)
        .unwrap_or_default()
}

/// Lifecycle of a load balancer in one backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerBackend: Send + Sync {
    /// Current status of the service's load balancer, `None` if it doesn't exist.
    async fn get(&self, svc: &Service) -> HwLBResult<Option<LoadBalancerStatus>>;

    async fn ensure(&self, svc: &Service, nodes: &[Node]) -> HwLBResult<LoadBalancerStatus>;

    /// Update the members of an existing load balancer.
    async fn update(&self, svc: &Service, nodes: &[Node]) -> HwLBResult<()>;

    async fn ensure_deleted(&self, svc: &Service) -> HwLBResult<()>;
}

/// A registry slot of a known backend version.
#[derive(Clone, Default)]
pub enum BackendSlot {
    Bound(Arc<dyn LoadBalancerBackend>),
    /// The version is known, but no implementation is provided.
    #[default]
    Unbound,
}

static NO_BACKEND: BackendSlot = BackendSlot::Unbound;

/// Dispatches lifecycle operations to the backend bound to the service's version.
///
/// Operations on unbound versions succeed without doing anything.
#[derive(Clone, Default)]
pub struct VersionRouter {
    elb: BackendSlot,
    alb: BackendSlot,
    plb: BackendSlot,
    nat: BackendSlot,
}

impl VersionRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a backend to a version. `NoneNeeded` can't be bound.
    #[must_use]
    pub fn bind(mut self, version: BackendVersion, backend: Arc<dyn LoadBalancerBackend>) -> Self {
        match self.slot_mut(version) {
            Some(slot) => *slot = BackendSlot::Bound(backend),
            None => tracing::warn!("Backends can't be bound to version {}", version),
        }
        self
    }

    fn slot_mut(&mut self, version: BackendVersion) -> Option<&mut BackendSlot> {
        match version {
            BackendVersion::NoneNeeded => None,
            BackendVersion::Elb => Some(&mut self.elb),
            BackendVersion::Alb => Some(&mut self.alb),
            BackendVersion::Plb => Some(&mut self.plb),
            BackendVersion::Nat => Some(&mut self.nat),
        }
    }

    #[must_use]
    pub fn slot(&self, version: BackendVersion) -> &BackendSlot {
        match version {
            BackendVersion::NoneNeeded => &NO_BACKEND,
            BackendVersion::Elb => &self.elb,
            BackendVersion::Alb => &self.alb,
            BackendVersion::Plb => &self.plb,
            BackendVersion::Nat => &self.nat,
        }
    }

    /// Resolve the backend of a service. Routing errors are propagated,
    /// unbound versions yield `None`.
    fn backend_for(&self, svc: &Service) -> HwLBResult<Option<&Arc<dyn LoadBalancerBackend>>> {
        let version = route(svc)?;
        match self.slot(version) {
            BackendSlot::Bound(backend) => Ok(Some(backend)),
            BackendSlot::Unbound => {
                if version == BackendVersion::NoneNeeded {
                    tracing::debug!("Service {} needs no load balancer", svc.name_any());
                } else {
                    tracing::warn!(
                        "Load balancer version {} is not supported yet, ignoring service {}",
                        version,
                        svc.name_any()
                    );
                }
                Ok(None)
            }
        }
    }

    pub async fn get(&self, svc: &Service) -> HwLBResult<Option<LoadBalancerStatus>> {
        match self.backend_for(svc)? {
            Some(backend) => backend.get(svc).await,
            None => Ok(None),
        }
    }

    pub async fn ensure(
        &self,
        svc: &Service,
        nodes: &[Node],
    ) -> HwLBResult<Option<LoadBalancerStatus>> {
        match self.backend_for(svc)? {
            Some(backend) => backend.ensure(svc, nodes).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn update(&self, svc: &Service, nodes: &[Node]) -> HwLBResult<()> {
        match self.backend_for(svc)? {
            Some(backend) => backend.update(svc, nodes).await,
            None => Ok(()),
        }
    }

    pub async fn ensure_deleted(&self, svc: &Service) -> HwLBResult<()> {
        match self.backend_for(svc)? {
            Some(backend) => backend.ensure_deleted(svc).await,
            None => Ok(()),
        }
    }

    /// Release the load balancer of a service that stopped asking for one,
    /// e.g. after its type changed. Only the class annotation picks the backend.
    ///
    /// An unsupported class never had a balancer, so there is nothing to release.
    pub async fn ensure_released(&self, svc: &Service) -> HwLBResult<()> {
        let version = match BackendVersion::from_class(class_of(svc)) {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!("Nothing to release for service {}: {}", svc.name_any(), err);
                return Ok(());
            }
        };
        match self.slot(version) {
            BackendSlot::Bound(backend) => backend.ensure_deleted(svc).await,
            BackendSlot::Unbound => Ok(()),
        }
    }
}
