//! Retry marker kept in the `kubernetes.io/elb.mark` annotation.
//!
//! The marker counts failed load balancer configurations of a service.
//! It is written with optimistic concurrency: a conflicting update
//! re-reads the service and tries again, at most [`consts::MAX_RETRY`]
//! times. Writing the marker is best-effort and never fails the caller.

use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};

use crate::{
    consts,
    error::{is_conflict, is_not_found},
    events::EventPublisher,
    kube_client::KubeClient,
};

/// Marker state of a service, as read from its annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMarker {
    Absent,
    Count(u32),
    /// Present but not a number. Counting restarts from the beginning.
    Unparseable,
}

impl RetryMarker {
    #[must_use]
    pub fn read(svc: &Service) -> Self {
        match svc.annotations().get(consts::ELB_MARK_ANN_NAME) {
            None => Self::Absent,
            Some(raw) => raw.parse().map_or(Self::Unparseable, Self::Count),
        }
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        match self {
            Self::Count(count) => count,
            Self::Absent | Self::Unparseable => 0,
        }
    }

    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        matches!(self, Self::Count(count) if count >= consts::MAX_RETRY)
    }
}

/// What happened to the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The marker was written with this value.
    Persisted(u32),
    Cleared,
    /// Nothing had to be written.
    Unchanged,
    /// The service no longer exists.
    Vanished,
    /// The marker had already reached the ceiling, nothing was written.
    CeilingReached,
    /// Every attempt failed.
    Exhausted,
}

enum Failure {
    Conflict,
    Other,
}

enum Write {
    Done,
    Vanished,
    Failed(Failure),
}

async fn send_warning(events: &dyn EventPublisher, svc: &Service, message: &str) {
    tracing::error!(
        "[{}/{}]{}",
        svc.namespace().unwrap_or_default(),
        svc.name_any(),
        message
    );
    events
        .warn(
            &svc.object_ref(&()),
            consts::REASON_CREATE_LB_FAILED,
            format!("Details: {message}"),
        )
        .await;
}

/// Persist `to_update`. On a conflict `current` is replaced with the
/// latest version of the service.
async fn persist(
    kube: &dyn KubeClient,
    current: &mut Service,
    to_update: &Service,
) -> Write {
    let namespace = current.namespace().unwrap_or_default();
    let name = current.name_any();
    match kube.replace_service(to_update).await {
        Ok(_) => Write::Done,
        // The service is being deleted, there is nothing to mark.
        Err(err) if is_not_found(&err) => {
            tracing::info!(
                "Not persisting update to service '{}/{}' that no longer exists: {}",
                namespace,
                name,
                err
            );
            Write::Vanished
        }
        Err(err) if is_conflict(&err) => match kube.get_service(&namespace, &name).await {
            Ok(latest) => {
                *current = latest;
                Write::Failed(Failure::Conflict)
            }
            Err(err) if is_not_found(&err) => Write::Vanished,
            Err(err) => {
                tracing::warn!("Get service({}/{}) error: {}", namespace, name, err);
                Write::Failed(Failure::Conflict)
            }
        },
        Err(err) => {
            tracing::warn!("Update service({}/{}) error: {}", namespace, name, err);
            Write::Failed(Failure::Other)
        }
    }
}

/// Count one more failed configuration of the service.
///
/// The attempt count is carried across conflicting writes, so every
/// retried write records a higher value than the one before it.
#[tracing::instrument(skip_all, fields(service = svc.name_any()))]
pub async fn mark_failure(
    kube: &dyn KubeClient,
    events: &dyn EventPublisher,
    svc: &Service,
) -> MarkOutcome {
    let mut current = svc.clone();
    let mut attempted = 0;
    let mut last_failure = Failure::Other;
    for _ in 0..consts::MAX_RETRY {
        let marker = RetryMarker::read(&current);
        // Retrying forever would flood the cloud API with requests.
        if marker.is_exhausted() {
            send_warning(
                events,
                &current,
                "Retry LoadBalancer configuration too many times",
            )
            .await;
            return MarkOutcome::CeilingReached;
        }
        let next = marker.count().max(attempted) + 1;
        attempted = next;

        let mut to_update = current.clone();
        to_update
            .annotations_mut()
            .insert(consts::ELB_MARK_ANN_NAME.to_string(), next.to_string());
        match persist(kube, &mut current, &to_update).await {
            Write::Done => {
                tracing::debug!("Retry marker set to {}", next);
                return MarkOutcome::Persisted(next);
            }
            Write::Vanished => return MarkOutcome::Vanished,
            Write::Failed(failure) => last_failure = failure,
        }
    }
    if matches!(last_failure, Failure::Conflict) {
        send_warning(
            events,
            &current,
            "Retry LoadBalancer configuration too many times, the service is updated concurrently",
        )
        .await;
    }
    MarkOutcome::Exhausted
}

/// Reset the marker once the backend finished its work.
///
/// An existing marker is removed. A missing marker is created with
/// zero only if `recreate_when_absent` is set.
#[tracing::instrument(skip_all, fields(service = svc.name_any()))]
pub async fn clear_marker(
    kube: &dyn KubeClient,
    svc: &Service,
    recreate_when_absent: bool,
) -> MarkOutcome {
    let mut current = svc.clone();
    for _ in 0..consts::MAX_RETRY {
        let mut to_update = current.clone();
        let outcome = if to_update
            .annotations_mut()
            .remove(consts::ELB_MARK_ANN_NAME)
            .is_some()
        {
            MarkOutcome::Cleared
        } else if recreate_when_absent {
            to_update
                .annotations_mut()
                .insert(consts::ELB_MARK_ANN_NAME.to_string(), "0".to_string());
            MarkOutcome::Persisted(0)
        } else {
            return MarkOutcome::Unchanged;
        };
        match persist(kube, &mut current, &to_update).await {
            Write::Done => return outcome,
            Write::Vanished => return MarkOutcome::Vanished,
            Write::Failed(_) => {}
        }
    }
    MarkOutcome::Exhausted
}
