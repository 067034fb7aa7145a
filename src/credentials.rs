//! Cache of cloud credentials read from the credential secret.
//!
//! Secrets are delivered by a watcher task through a bounded queue,
//! the cache itself only applies the queued events.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{Stream, StreamExt};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use lru::LruCache;
use tokio::sync::mpsc;

use crate::{consts, error::CredentialError};

/// Credentials as stored in the secret.
///
/// Every field is base64-encoded until [`CloudCredential::decode`] is called,
/// which may happen only once per instance.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CloudCredential {
    pub credential: String,
    pub access_key: String,
    pub secret_key: String,
    decoded: bool,
}

impl std::fmt::Debug for CloudCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredential")
            .field("decoded", &self.decoded)
            .finish_non_exhaustive()
    }
}

impl CloudCredential {
    #[must_use]
    pub fn new(credential: &str, access_key: &str, secret_key: &str) -> Self {
        Self {
            credential: credential.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            decoded: false,
        }
    }

    #[must_use]
    pub fn from_secret(secret: &Secret) -> Self {
        let field = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| STANDARD.encode(&value.0))
                .unwrap_or_default()
        };
        Self {
            credential: field(consts::SECRET_CREDENTIAL_KEY),
            access_key: field(consts::SECRET_ACCESS_KEY),
            secret_key: field(consts::SECRET_SECRET_KEY),
            decoded: false,
        }
    }

    #[must_use]
    pub const fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// Decode all fields in place.
    ///
    /// Fields are only overwritten if all of them decode successfully.
    pub fn decode(&mut self) -> Result<(), CredentialError> {
        if self.decoded {
            return Err(CredentialError::AlreadyDecoded);
        }
        let credential = decode_field(consts::SECRET_CREDENTIAL_KEY, &self.credential)?;
        let access_key = decode_field(consts::SECRET_ACCESS_KEY, &self.access_key)?;
        let secret_key = decode_field(consts::SECRET_SECRET_KEY, &self.secret_key)?;
        self.credential = credential;
        self.access_key = access_key;
        self.secret_key = secret_key;
        self.decoded = true;
        Ok(())
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<String, CredentialError> {
    let bytes = STANDARD.decode(value.trim()).map_err(|source| {
        tracing::error!("Decoding {} of the credential secret failed", field);
        CredentialError::Decode { field, source }
    })?;
    String::from_utf8(bytes).map_err(|_| CredentialError::NotUtf8 { field })
}

/// Deleted secret, as the watcher could observe it.
#[derive(Debug, Clone)]
pub enum DeletedSecret {
    Live(Secret),
    /// The deletion happened while the watch was down. Only the last
    /// known state is available and it has to be unwrapped first.
    FinalStateUnknown {
        key: String,
        last_state: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub enum SecretEvent {
    /// Secret was added or updated.
    Applied(Secret),
    Deleted(DeletedSecret),
}

#[derive(Debug, Clone)]
struct CachedSecret {
    data: Option<BTreeMap<String, ByteString>>,
    credential: CloudCredential,
}

pub struct CredentialCache {
    secret_name: String,
    entries: Mutex<LruCache<String, CachedSecret>>,
}

impl CredentialCache {
    #[must_use]
    pub fn new(secret_name: &str) -> Self {
        Self::with_capacity(
            secret_name,
            NonZeroUsize::new(consts::CREDENTIAL_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
        )
    }

    #[must_use]
    pub fn with_capacity(secret_name: &str, capacity: NonZeroUsize) -> Self {
        Self {
            secret_name: secret_name.to_string(),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, CachedSecret>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a still encoded copy of the credential for the namespace.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<CloudCredential> {
        let key = format!("{namespace}/{name}");
        self.entries().get(&key).map(|entry| entry.credential.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn key_of(&self, secret: &Secret) -> Option<String> {
        if secret.name_any() != self.secret_name {
            return None;
        }
        Some(format!(
            "{}/{}",
            secret.namespace().unwrap_or_default(),
            secret.name_any()
        ))
    }

    pub fn handle(&self, event: SecretEvent) {
        match event {
            SecretEvent::Applied(secret) => self.upsert(&secret),
            SecretEvent::Deleted(deleted) => self.remove(deleted),
        }
    }

    fn upsert(&self, secret: &Secret) {
        let Some(key) = self.key_of(secret) else {
            return;
        };
        let mut entries = self.entries();
        // `peek` leaves the recency order untouched.
        if entries
            .peek(&key)
            .is_some_and(|cached| cached.data == secret.data)
        {
            tracing::trace!("Secret {} did not change", key);
            return;
        }
        tracing::debug!("Caching credentials from secret {}", key);
        entries.put(
            key,
            CachedSecret {
                data: secret.data.clone(),
                credential: CloudCredential::from_secret(secret),
            },
        );
    }

    fn remove(&self, deleted: DeletedSecret) {
        let secret = match deleted {
            DeletedSecret::Live(secret) => secret,
            DeletedSecret::FinalStateUnknown { key, last_state } => {
                match serde_json::from_value::<Secret>(last_state) {
                    Ok(secret) => secret,
                    Err(err) => {
                        tracing::error!(
                            "Couldn't get secret {} from deletion placeholder: {}",
                            key,
                            err
                        );
                        return;
                    }
                }
            }
        };
        let Some(key) = self.key_of(&secret) else {
            return;
        };
        if self.entries().pop(&key).is_some() {
            tracing::info!("Secret {} was deleted, dropping cached credentials", key);
        }
    }

    /// Apply queued secret events until the sender side is closed.
    pub async fn consume(self: Arc<Self>, mut events: mpsc::Receiver<SecretEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::warn!("Secret event queue was closed");
    }
}

/// Turns raw watcher events into cache events.
///
/// It remembers the secrets it has seen, so that secrets missing after
/// a relist are reported as deleted.
#[derive(Debug, Default)]
pub struct SecretTracker {
    known: HashMap<String, Secret>,
    relisted: Option<HashSet<String>>,
}

impl SecretTracker {
    fn key(secret: &Secret) -> String {
        format!(
            "{}/{}",
            secret.namespace().unwrap_or_default(),
            secret.name_any()
        )
    }

    pub fn observe(&mut self, event: watcher::Event<Secret>) -> Vec<SecretEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                vec![]
            }
            watcher::Event::InitApply(secret) | watcher::Event::Apply(secret) => {
                let key = Self::key(&secret);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                self.known.insert(key, secret.clone());
                vec![SecretEvent::Applied(secret)]
            }
            watcher::Event::Delete(secret) => {
                self.known.remove(&Self::key(&secret));
                vec![SecretEvent::Deleted(DeletedSecret::Live(secret))]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return vec![];
                };
                let gone = self
                    .known
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect::<Vec<_>>();
                gone.into_iter()
                    .filter_map(|key| {
                        let secret = self.known.remove(&key)?;
                        Some(SecretEvent::Deleted(DeletedSecret::FinalStateUnknown {
                            last_state: serde_json::to_value(&secret).unwrap_or_default(),
                            key,
                        }))
                    })
                    .collect()
            }
        }
    }
}

/// Watch credential secrets in all namespaces and queue their changes.
pub async fn watch_secrets(
    client: kube::Client,
    secret_name: String,
    queue: mpsc::Sender<SecretEvent>,
) {
    let api = Api::<Secret>::all(client);
    let config = watcher::Config::default().fields(&format!("metadata.name={secret_name}"));
    forward_secret_events(watcher(api, config).default_backoff(), queue).await;
}

/// Queue the cache events of a secret watch stream until either side ends.
pub async fn forward_secret_events<S>(stream: S, queue: mpsc::Sender<SecretEvent>)
where
    S: Stream<Item = Result<watcher::Event<Secret>, watcher::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut tracker = SecretTracker::default();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for secret_event in tracker.observe(event) {
                    if queue.send(secret_event).await.is_err() {
                        tracing::warn!("Credential cache is gone, stopping secret watcher");
                        return;
                    }
                }
            }
            Err(err) => tracing::warn!("Secret watch error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn b64(value: &str) -> String {
        STANDARD.encode(value)
    }

    fn secret(namespace: &str, name: &str, access: &str) -> Secret {
        let data = [
            (consts::SECRET_CREDENTIAL_KEY, "token"),
            (consts::SECRET_ACCESS_KEY, access),
            (consts::SECRET_SECRET_KEY, "sk"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_all_fields() {
        let mut credential = CloudCredential::new(&b64("token"), &b64("ak"), &b64("sk"));
        credential.decode().unwrap();
        assert!(credential.is_decoded());
        assert_eq!(credential.credential, "token");
        assert_eq!(credential.access_key, "ak");
        assert_eq!(credential.secret_key, "sk");
    }

    #[test]
    fn decoding_twice_is_a_contract_violation() {
        let mut credential = CloudCredential::new(&b64("token"), &b64("ak"), &b64("sk"));
        credential.decode().unwrap();
        assert!(matches!(
            credential.decode(),
            Err(CredentialError::AlreadyDecoded)
        ));
        assert_eq!(credential.access_key, "ak");
    }

    #[test]
    fn malformed_field_leaves_record_untouched() {
        let mut credential = CloudCredential::new(&b64("token"), "not base64!", &b64("sk"));
        let err = credential.decode().unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Decode {
                field: consts::SECRET_ACCESS_KEY,
                ..
            }
        ));
        assert!(!credential.is_decoded());
        assert_eq!(credential.credential, b64("token"));
    }

    #[test]
    fn secret_from_wire_json_decodes_once() {
        let secret: Secret = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "paas.elb", "namespace": "default"},
            "data": {
                "security.credential": "dG9rZW4=",
                "access": "YWs=",
                "secret": "c2s="
            }
        }))
        .unwrap();
        let mut credential = CloudCredential::from_secret(&secret);
        assert_eq!(credential.access_key, "YWs=");
        credential.decode().unwrap();
        assert_eq!(credential.credential, "token");
        assert_eq!(credential.access_key, "ak");
        assert_eq!(credential.secret_key, "sk");
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        let credential = CloudCredential::new("c3VwZXI=", "ak-value", "sk-value");
        let printed = format!("{credential:?}");
        assert!(!printed.contains("ak-value"));
        assert!(!printed.contains("sk-value"));
    }

    #[test]
    fn only_configured_name_is_cached() {
        let cache = CredentialCache::new("paas.elb");
        cache.handle(SecretEvent::Applied(secret("default", "other", "ak")));
        assert!(cache.is_empty());

        cache.handle(SecretEvent::Applied(secret("default", "paas.elb", "ak")));
        let mut credential = cache.get("default", "paas.elb").unwrap();
        assert!(!credential.is_decoded());
        credential.decode().unwrap();
        assert_eq!(credential.access_key, "ak");
        assert!(cache.get("kube-system", "paas.elb").is_none());
    }

    #[test]
    fn cached_copies_decode_independently() {
        let cache = CredentialCache::new("paas.elb");
        cache.handle(SecretEvent::Applied(secret("default", "paas.elb", "ak")));
        let mut first = cache.get("default", "paas.elb").unwrap();
        first.decode().unwrap();
        let mut second = cache.get("default", "paas.elb").unwrap();
        second.decode().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = CredentialCache::new("paas.elb");
        for idx in 0..=consts::CREDENTIAL_CACHE_SIZE {
            cache.handle(SecretEvent::Applied(secret(
                &format!("ns-{idx}"),
                "paas.elb",
                "ak",
            )));
        }
        assert_eq!(cache.len(), 200);
        assert!(cache.get("ns-0", "paas.elb").is_none());
        assert!(cache.get("ns-1", "paas.elb").is_some());
        assert!(cache.get("ns-200", "paas.elb").is_some());
    }

    #[test]
    fn identical_update_keeps_recency() {
        let cache = CredentialCache::with_capacity("paas.elb", NonZeroUsize::new(2).unwrap());
        cache.handle(SecretEvent::Applied(secret("a", "paas.elb", "ak")));
        cache.handle(SecretEvent::Applied(secret("b", "paas.elb", "ak")));
        // Same payload for "a": it must stay the least recently used entry.
        cache.handle(SecretEvent::Applied(secret("a", "paas.elb", "ak")));
        cache.handle(SecretEvent::Applied(secret("c", "paas.elb", "ak")));
        assert!(cache.get("a", "paas.elb").is_none());
        assert!(cache.get("b", "paas.elb").is_some());
    }

    #[test]
    fn changed_update_overwrites() {
        let cache = CredentialCache::new("paas.elb");
        cache.handle(SecretEvent::Applied(secret("a", "paas.elb", "old")));
        cache.handle(SecretEvent::Applied(secret("a", "paas.elb", "new")));
        let mut credential = cache.get("a", "paas.elb").unwrap();
        credential.decode().unwrap();
        assert_eq!(credential.access_key, "new");
    }

    #[test]
    fn delete_evicts_entry() {
        let cache = CredentialCache::new("paas.elb");
        let live = secret("a", "paas.elb", "ak");
        cache.handle(SecretEvent::Applied(live.clone()));
        cache.handle(SecretEvent::Deleted(DeletedSecret::Live(live)));
        assert!(cache.get("a", "paas.elb").is_none());
    }

    #[test]
    fn placeholder_delete_is_unwrapped() {
        let cache = CredentialCache::new("paas.elb");
        let live = secret("a", "paas.elb", "ak");
        cache.handle(SecretEvent::Applied(live.clone()));
        cache.handle(SecretEvent::Deleted(DeletedSecret::FinalStateUnknown {
            key: "a/paas.elb".to_string(),
            last_state: serde_json::to_value(&live).unwrap(),
        }));
        assert!(cache.is_empty());
    }

    #[test]
    fn broken_placeholder_is_dropped() {
        let cache = CredentialCache::new("paas.elb");
        cache.handle(SecretEvent::Applied(secret("a", "paas.elb", "ak")));
        cache.handle(SecretEvent::Deleted(DeletedSecret::FinalStateUnknown {
            key: "a/paas.elb".to_string(),
            last_state: serde_json::json!({"metadata": "not an object"}),
        }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn tracker_reports_secrets_gone_after_relist() {
        let mut tracker = SecretTracker::default();
        let a = secret("a", "paas.elb", "ak");
        let b = secret("b", "paas.elb", "ak");
        assert_eq!(tracker.observe(watcher::Event::Apply(a.clone())).len(), 1);
        assert_eq!(tracker.observe(watcher::Event::Apply(b)).len(), 1);

        assert!(tracker.observe(watcher::Event::Init).is_empty());
        assert_eq!(tracker.observe(watcher::Event::InitApply(a)).len(), 1);
        let events = tracker.observe(watcher::Event::InitDone);
        assert_eq!(events.len(), 1);
        let SecretEvent::Deleted(DeletedSecret::FinalStateUnknown { key, .. }) = &events[0] else {
            panic!("expected deletion placeholder, got {events:?}");
        };
        assert_eq!(key, "b/paas.elb");

        let cache = CredentialCache::new("paas.elb");
        cache.handle(SecretEvent::Applied(secret("b", "paas.elb", "ak")));
        for event in events {
            cache.handle(event);
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn consume_applies_queued_events() {
        let cache = Arc::new(CredentialCache::new("paas.elb"));
        let (tx, rx) = mpsc::channel(4);
        let consumer = tokio::spawn(cache.clone().consume(rx));
        tx.send(SecretEvent::Applied(secret("a", "paas.elb", "ak")))
            .await
            .unwrap();
        drop(tx);
        consumer.await.unwrap();
        assert!(cache.get("a", "paas.elb").is_some());
    }

    #[tokio::test]
    async fn watch_stream_is_forwarded_to_queue() {
        let a = secret("a", "paas.elb", "ak");
        let b = secret("b", "paas.elb", "ak");
        let stream = futures::stream::iter(
            vec![
                watcher::Event::Apply(a.clone()),
                watcher::Event::Apply(b),
                watcher::Event::Init,
                watcher::Event::InitApply(a),
                watcher::Event::InitDone,
            ]
            .into_iter()
            .map(Ok::<_, watcher::Error>),
        );
        let cache = Arc::new(CredentialCache::new("paas.elb"));
        let (tx, rx) = mpsc::channel(1);
        let consumer = tokio::spawn(cache.clone().consume(rx));
        forward_secret_events(stream, tx).await;
        consumer.await.unwrap();

        assert!(cache.get("a", "paas.elb").is_some());
        // "b" did not come back after the relist.
        assert!(cache.get("b", "paas.elb").is_none());
    }

    #[tokio::test]
    async fn forwarding_stops_when_cache_is_gone() {
        let stream = futures::stream::iter(
            (0..10)
                .map(|idx| watcher::Event::Apply(secret(&format!("ns-{idx}"), "paas.elb", "ak")))
                .map(Ok::<_, watcher::Error>),
        );
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_secret_events(stream, tx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_run_while_events_are_applied() {
        let cache = Arc::new(CredentialCache::new("paas.elb"));
        cache.handle(SecretEvent::Applied(secret("stable", "paas.elb", "ak")));
        let (tx, rx) = mpsc::channel(8);
        let consumer = tokio::spawn(cache.clone().consume(rx));

        let readers = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let mut credential = cache.get("stable", "paas.elb").unwrap();
                        credential.decode().unwrap();
                        assert_eq!(credential.access_key, "ak");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();

        for idx in 0..100 {
            tx.send(SecretEvent::Applied(secret(
                &format!("ns-{idx}"),
                "paas.elb",
                &format!("ak-{idx}"),
            )))
            .await
            .unwrap();
        }
        drop(tx);
        for reader in readers {
            reader.await.unwrap();
        }
        consumer.await.unwrap();

        assert_eq!(cache.len(), 101);
        let mut last = cache.get("ns-99", "paas.elb").unwrap();
        last.decode().unwrap();
        assert_eq!(last.access_key, "ak-99");
    }
}
