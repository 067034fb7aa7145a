use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;

use crate::{
    consts,
    error::{HwLBError, HwLBResult},
    kube_client::KubeClient,
};

/// Check if service has the finalizer.
#[must_use]
pub fn check(svc: &Service) -> bool {
    svc.finalizers()
        .iter()
        .any(|item| item == consts::FINALIZER_NAME)
}

/// Add the finalizer, so the load balancer is released
/// before the service goes away.
///
/// Finalizers of other controllers are kept.
pub async fn add(kube: &dyn KubeClient, svc: &Service) -> HwLBResult<()> {
    if check(svc) {
        return Ok(());
    }
    let namespace = svc.namespace().ok_or(HwLBError::SkipService)?;
    let mut finalizers = svc.finalizers().to_vec();
    finalizers.push(consts::FINALIZER_NAME.to_string());
    kube.patch_service_metadata(
        &namespace,
        &svc.name_any(),
        &json!({ "finalizers": finalizers }),
    )
    .await?;
    Ok(())
}

/// Remove the finalizer from the service.
///
/// If the service does not have the finalizer, this function does nothing.
pub async fn remove(kube: &dyn KubeClient, svc: &Service) -> HwLBResult<()> {
    if !check(svc) {
        return Ok(());
    }
    let namespace = svc.namespace().ok_or(HwLBError::SkipService)?;
    let finalizers = svc
        .finalizers()
        .iter()
        .filter(|item| item.as_str() != consts::FINALIZER_NAME)
        .collect::<Vec<_>>();
    kube.patch_service_metadata(
        &namespace,
        &svc.name_any(),
        &json!({ "finalizers": finalizers }),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(finalizers: &[&str]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(finalizers.iter().map(ToString::to_string).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_keeps_foreign_finalizers() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata()
            .withf(|namespace, name, metadata| {
                namespace == "default"
                    && name == "web"
                    && *metadata == json!({ "finalizers": ["other", consts::FINALIZER_NAME] })
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        add(&kube, &service(&["other"])).await.unwrap();
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata().never();
        let svc = service(&[consts::FINALIZER_NAME]);
        assert!(check(&svc));
        add(&kube, &svc).await.unwrap();
    }

    #[tokio::test]
    async fn remove_drops_only_own_finalizer() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_service_metadata()
            .withf(|_, _, metadata| *metadata == json!({ "finalizers": ["other"] }))
            .times(1)
            .returning(|_, _, _| Ok(()));
        remove(&kube, &service(&["other", consts::FINALIZER_NAME]))
            .await
            .unwrap();

        let mut untouched = MockKubeClient::new();
        untouched.expect_patch_service_metadata().never();
        remove(&untouched, &service(&["other"])).await.unwrap();
    }
}
