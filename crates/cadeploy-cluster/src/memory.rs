//! In-process [`ClusterApi`] for tests.
//!
//! Objects live in a map keyed by `(namespace, kind, name)`. Every call is
//! journaled before it is evaluated, so tests can assert on attempted calls
//! even when an injected failure rejects them.
//!
//! Each write stamps `metadata.resourceVersion` from a cluster-wide counter.
//! A patch naming a different `resourceVersion` fails with `409 Conflict`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cadeploy_render::ResourceKind;
use serde_json::{Map, Value, json};

use crate::api::ClusterApi;
use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Patch,
    Delete,
    List,
}

/// One journaled call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub verb: Verb,
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Manifest or patch body.
    pub body: Option<Value>,
}

struct Failure {
    verb: Verb,
    kind: ResourceKind,
    name: Option<String>,
    error: ClusterError,
    once: bool,
}

impl Failure {
    fn matches(&self, verb: Verb, kind: ResourceKind, name: Option<&str>) -> bool {
        self.verb == verb
            && self.kind == kind
            && self.name.as_deref().is_none_or(|n| Some(n) == name)
    }
}

struct Stall {
    verb: Verb,
    kind: ResourceKind,
    delay: Duration,
}

type Key = (String, ResourceKind, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    journal: Vec<Call>,
    failures: Vec<Failure>,
    stalls: Vec<Stall>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> Value {
        self.revision += 1;
        json!(self.revision.to_string())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the journal from the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every matching call with `error`. `name = None` matches any name.
    pub fn fail_on(&self, verb: Verb, kind: ResourceKind, name: Option<&str>, error: ClusterError) {
        self.lock().failures.push(Failure {
            verb,
            kind,
            name: name.map(str::to_string),
            error,
            once: false,
        });
    }

    /// Fail only the next matching call.
    pub fn fail_once(&self, verb: Verb, kind: ResourceKind, name: Option<&str>, error: ClusterError) {
        self.lock().failures.push(Failure {
            verb,
            kind,
            name: name.map(str::to_string),
            error,
            once: true,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Hold every matching call for `delay` before it is evaluated.
    pub fn stall_on(&self, verb: Verb, kind: ResourceKind, delay: Duration) {
        self.lock().stalls.push(Stall { verb, kind, delay });
    }

    async fn stall(&self, verb: Verb, kind: ResourceKind) {
        let delay = self
            .lock()
            .stalls
            .iter()
            .find(|s| s.verb == verb && s.kind == kind)
            .map(|s| s.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    /// Journaled calls other than lists.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb != Verb::List)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().journal.clear();
    }

    pub fn get(&self, namespace: &str, kind: ResourceKind, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), kind, name.to_string()))
            .cloned()
    }

    pub fn names(&self, namespace: &str, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(ns, k, _)| ns == namespace && *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Store an object as-is, bypassing the journal.
    pub fn insert(&self, namespace: &str, kind: ResourceKind, name: &str, object: Value) {
        self.lock()
            .objects
            .insert((namespace.to_string(), kind, name.to_string()), object);
    }

    /// Simulate the deployment controller reporting ready replicas.
    pub fn set_available_replicas(&self, namespace: &str, name: &str, replicas: u32) {
        let mut inner = self.lock();
        let key = (namespace.to_string(), ResourceKind::Deployment, name.to_string());
        let revision = inner.next_revision();
        if let Some(object) = inner.objects.get_mut(&key) {
            object["status"]["availableReplicas"] = json!(replicas);
            object["metadata"]["resourceVersion"] = revision;
        }
    }

    fn enter(
        &self,
        verb: Verb,
        namespace: &str,
        kind: ResourceKind,
        name: Option<&str>,
        body: Option<&Value>,
    ) -> Result<MutexGuard<'_, Inner>, ClusterError> {
        let mut inner = self.lock();
        inner.journal.push(Call {
            verb,
            namespace: namespace.to_string(),
            kind,
            name: name.map(str::to_string),
            body: body.cloned(),
        });
        if let Some(pos) = inner.failures.iter().position(|f| f.matches(verb, kind, name)) {
            let error = inner.failures[pos].error.clone();
            if inner.failures[pos].once {
                inner.failures.remove(pos);
            }
            return Err(error);
        }
        Ok(inner)
    }
}

fn not_found(kind: ResourceKind, name: &str) -> ClusterError {
    ClusterError::api(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

fn conflict(kind: ResourceKind, name: &str) -> ClusterError {
    ClusterError::api(
        409,
        "Conflict",
        format!("{kind} \"{name}\" has been modified; apply your changes to the latest version"),
    )
}

/// Strategic merge, reduced to what the deployer sends: maps merge
/// recursively, `null` deletes, and lists of named maps merge by `name`.
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        Value::Array(entries) if !entries.is_empty() && entries.iter().all(has_name) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Value::Array(target) = target {
                for entry in entries {
                    match target.iter_mut().find(|t| t.get("name") == entry.get("name")) {
                        Some(existing) => merge(existing, entry),
                        None => {
                            let mut fresh = Value::Null;
                            merge(&mut fresh, entry);
                            target.push(fresh);
                        }
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn has_name(value: &Value) -> bool {
    value.get("name").is_some()
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = &object["metadata"]["labels"];
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).and_then(Value::as_str) == Some(value.trim()),
            None => labels.get(term.trim()).is_some(),
        }
    })
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create(
        &self,
        namespace: &str,
        kind: ResourceKind,
        manifest: &Value,
    ) -> ClusterResult<()> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::Manifest("metadata.name is required".to_string()))?;
        self.stall(Verb::Create, kind).await;
        let mut inner = self.enter(Verb::Create, namespace, kind, Some(&name), Some(manifest))?;
        let key = (namespace.to_string(), kind, name.clone());
        if inner.objects.contains_key(&key) {
            return Err(ClusterError::api(
                409,
                "AlreadyExists",
                format!("{kind} \"{name}\" already exists"),
            ));
        }
        let mut object = manifest.clone();
        object["metadata"]["resourceVersion"] = inner.next_revision();
        inner.objects.insert(key, object);
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> ClusterResult<()> {
        self.stall(Verb::Patch, kind).await;
        let mut inner = self.enter(Verb::Patch, namespace, kind, Some(name), Some(patch))?;
        let revision = inner.next_revision();
        let key = (namespace.to_string(), kind, name.to_string());
        let object = inner.objects.get_mut(&key).ok_or_else(|| not_found(kind, name))?;
        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            if object["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(conflict(kind, name));
            }
        }
        merge(object, patch);
        object["metadata"]["resourceVersion"] = revision;
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> ClusterResult<()> {
        self.stall(Verb::Delete, kind).await;
        let mut inner = self.enter(Verb::Delete, namespace, kind, Some(name), None)?;
        let key = (namespace.to_string(), kind, name.to_string());
        inner
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found(kind, name))
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>> {
        self.stall(Verb::List, kind).await;
        let inner = self.enter(Verb::List, namespace, kind, None, None)?;
        Ok(inner
            .objects
            .iter()
            .filter(|((ns, k, _), object)| {
                ns == namespace && *k == kind && matches_selector(object, label_selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }
}
