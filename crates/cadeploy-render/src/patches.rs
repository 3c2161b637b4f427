//! Strategic-merge patch bodies for live objects.
//!
//! Containers and volumes merge by `name`, so a patch only has to name the
//! entry it changes. A `null` value deletes the key on the server.
//!
//! Patches that rewrite the props annotation can carry the
//! `resourceVersion` the props were read at; the server then rejects the
//! patch with `409 Conflict` if the Deployment moved on in between.

use cadeploy_core::types::{PROPS_ANNOTATION, TOUCH_ANNOTATION};
use cadeploy_core::{AppPatch, AppProps, RedisPatch, RedisProps};
use serde_json::{Map, Value, json};

use crate::manifests::{egress_bandwidth, gigabytes, megabytes, millicores};

const EGRESS_ANNOTATION: &str = "kubernetes.io/egress-bandwidth";

/// Patch for the app Deployment, always carrying the new props annotation.
pub fn app_patch(
    baseline: &AppProps,
    patch: &AppPatch,
    props_annotation: &str,
    resource_version: Option<&str>,
) -> Value {
    let mut body = props_annotation_patch(props_annotation, resource_version);
    if let Some(instances) = patch.instances {
        body["spec"]["replicas"] = json!(instances);
    }

    let mut pod = Value::Null;
    if let Some(touch) = &patch.touch {
        pod["metadata"]["annotations"][TOUCH_ANNOTATION] = json!(touch);
    }
    if let Some(egress) = patch.egress_limit_mbps {
        pod["metadata"]["annotations"][EGRESS_ANNOTATION] = json!(egress_bandwidth(egress));
    }
    if let Some(gvisor) = patch.is_gvisor {
        pod["spec"]["runtimeClassName"] = runtime_class(gvisor);
    }
    if patch.pool_key.is_some() || patch.pool_value.is_some() {
        pod["spec"]["nodeSelector"] = node_selector(
            &baseline.pool_key,
            patch.pool_key.as_deref().unwrap_or(&baseline.pool_key),
            patch.pool_value.as_deref().unwrap_or(&baseline.pool_value),
        );
    }

    let mut container = Map::new();
    if let Some(image) = &patch.image {
        container.insert("image".to_string(), json!(image));
    }
    if patch.touches_resources() {
        let mut requests = Map::new();
        let mut limits = Map::new();
        put(&mut requests, "cpu", patch.cpu_millis.map(millicores));
        put(&mut requests, "memory", patch.memory_mb.map(megabytes));
        put(&mut requests, "ephemeral-storage", patch.storage_mb.map(megabytes));
        put(&mut limits, "cpu", patch.cpu_limit_millis.map(millicores));
        put(&mut limits, "memory", patch.memory_limit_mb.map(megabytes));
        put(&mut limits, "ephemeral-storage", patch.storage_limit_mb.map(megabytes));
        container.insert("resources".to_string(), resources(requests, limits));
    }
    if !container.is_empty() {
        container.insert("name".to_string(), json!("app"));
        pod["spec"]["containers"] = json!([container]);
    }

    if !pod.is_null() {
        body["spec"]["template"] = pod;
    }
    body
}

/// Patch for the cache Deployment, or `None` when the change does not
/// reach the pod (volume size lives on the claim).
pub fn redis_patch(baseline: &RedisProps, patch: &RedisPatch) -> Option<Value> {
    let mut pod = Value::Null;

    if let Some(gvisor) = patch.is_gvisor {
        pod["spec"]["runtimeClassName"] = runtime_class(gvisor);
    }
    if patch.pool_key.is_some() || patch.pool_value.is_some() {
        pod["spec"]["nodeSelector"] = node_selector(
            &baseline.pool_key,
            patch.pool_key.as_deref().unwrap_or(&baseline.pool_key),
            patch.pool_value.as_deref().unwrap_or(&baseline.pool_value),
        );
    }
    if patch.touches_resources() {
        let mut requests = Map::new();
        let mut limits = Map::new();
        put(&mut requests, "cpu", patch.cpu_millis.map(millicores));
        put(&mut requests, "memory", patch.memory_mb.map(megabytes));
        put(&mut limits, "cpu", patch.cpu_limit_millis.map(millicores));
        put(&mut limits, "memory", patch.memory_limit_mb.map(megabytes));
        pod["spec"]["containers"] = json!([{
            "name": "redis",
            "resources": resources(requests, limits),
        }]);
    }
    if patch.is_dedicated_volume == Some(true) {
        let mut target = baseline.clone();
        target.is_dedicated_volume = true;
        pod["spec"]["volumes"] = dedicated_volume_entry(&target);
    }

    (!pod.is_null()).then(|| json!({ "spec": { "template": pod } }))
}

/// Grow a dedicated volume claim.
pub fn volume_resize_patch(size_gb: u32) -> Value {
    json!({
        "spec": {
            "resources": {
                "requests": { "storage": gigabytes(size_gb) }
            }
        }
    })
}

/// Bump the pod-template touch annotation to roll every pod.
pub fn restart_patch(touch: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": { "annotations": { TOUCH_ANNOTATION: touch } }
            }
        }
    })
}

/// Rewrite only the props annotation; the pods are left alone.
pub fn props_annotation_patch(props_annotation: &str, resource_version: Option<&str>) -> Value {
    let mut body = json!({
        "metadata": {
            "annotations": { PROPS_ANNOTATION: props_annotation }
        }
    });
    if let Some(version) = resource_version {
        body["metadata"]["resourceVersion"] = json!(version);
    }
    body
}

fn dedicated_volume_entry(props: &RedisProps) -> Value {
    json!([{
        "name": "data",
        "nfs": null,
        "persistentVolumeClaim": { "claimName": props.volume_claim_name() },
    }])
}

fn runtime_class(gvisor: bool) -> Value {
    if gvisor { json!("gvisor") } else { Value::Null }
}

/// New selector; the old key is deleted when the key itself changes.
fn node_selector(old_key: &str, key: &str, value: &str) -> Value {
    let mut selector = Map::new();
    if old_key != key {
        selector.insert(old_key.to_string(), Value::Null);
    }
    selector.insert(key.to_string(), json!(value));
    Value::Object(selector)
}

fn resources(requests: Map<String, Value>, limits: Map<String, Value>) -> Value {
    let mut out = Map::new();
    if !requests.is_empty() {
        out.insert("requests".to_string(), Value::Object(requests));
    }
    if !limits.is_empty() {
        out.insert("limits".to_string(), Value::Object(limits));
    }
    Value::Object(out)
}

fn put(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadeploy_core::DeploymentId;

    fn app() -> AppProps {
        let id = DeploymentId::parse("alice-foo").unwrap();
        AppProps {
            id,
            namespace: "apps".to_string(),
            redis_namespace: "caches".to_string(),
            app_publisher: "alice".to_string(),
            app_local_name: "foo".to_string(),
            app_suffix: "cafjs.com".to_string(),
            instances: 1,
            cpu_millis: 100,
            cpu_limit_millis: 200,
            memory_mb: 128,
            memory_limit_mb: 256,
            storage_mb: 256,
            storage_limit_mb: 512,
            egress_limit_mbps: 20,
            pool_key: "pool".to_string(),
            pool_value: "untrusted".to_string(),
            is_gvisor: true,
            is_incubator: true,
            is_untrusted: true,
            image: "app:1".to_string(),
            cdn: None,
            env: Vec::new(),
            args: Vec::new(),
            touch: "t0".to_string(),
        }
    }

    fn redis() -> RedisProps {
        RedisProps {
            id: DeploymentId::parse("alice-foo").unwrap(),
            namespace: "caches".to_string(),
            image: "redis:7".to_string(),
            cpu_millis: 50,
            cpu_limit_millis: 100,
            memory_mb: 64,
            memory_limit_mb: 128,
            pool_key: "pool".to_string(),
            pool_value: "untrusted".to_string(),
            is_gvisor: true,
            timestamp: "17".to_string(),
            is_dedicated_volume: false,
            dedicated_volume_size_gb: 10,
            is_untrusted: true,
        }
    }

    #[test]
    fn replicas_only() {
        let patch = AppPatch {
            instances: Some(3),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", None);
        assert_eq!(
            body,
            json!({
                "metadata": {"annotations": {"cadeploy.io/props": "P"}},
                "spec": {"replicas": 3}
            })
        );
    }

    #[test]
    fn resources_merge_by_container_name() {
        let patch = AppPatch {
            cpu_millis: Some(250),
            memory_limit_mb: Some(512),
            image: Some("app:2".to_string()),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", None);
        let container = &body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "app");
        assert_eq!(container["image"], "app:2");
        assert_eq!(
            container["resources"],
            json!({"requests": {"cpu": "250m"}, "limits": {"memory": "512M"}})
        );
    }

    #[test]
    fn pool_key_change_removes_old_key() {
        let patch = AppPatch {
            pool_key: Some("dedicated".to_string()),
            pool_value: Some("trusted".to_string()),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", None);
        assert_eq!(
            body["spec"]["template"]["spec"]["nodeSelector"],
            json!({"pool": null, "dedicated": "trusted"})
        );
    }

    #[test]
    fn gvisor_off_clears_runtime_class() {
        let patch = AppPatch {
            is_gvisor: Some(false),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", None);
        assert!(body["spec"]["template"]["spec"]["runtimeClassName"].is_null());
        assert!(
            body["spec"]["template"]["spec"]
                .as_object()
                .unwrap()
                .contains_key("runtimeClassName")
        );
    }

    #[test]
    fn touch_and_egress_go_to_pod_annotations() {
        let patch = AppPatch {
            touch: Some("t1".to_string()),
            egress_limit_mbps: Some(50),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", None);
        assert_eq!(
            body["spec"]["template"]["metadata"]["annotations"],
            json!({"cadeploy.io/touch": "t1", "kubernetes.io/egress-bandwidth": "50M"})
        );
    }

    #[test]
    fn redis_size_only_has_no_deployment_patch() {
        let patch = RedisPatch {
            dedicated_volume_size_gb: Some(15),
            ..RedisPatch::default()
        };
        assert_eq!(redis_patch(&redis(), &patch), None);
        assert_eq!(
            volume_resize_patch(15),
            json!({"spec": {"resources": {"requests": {"storage": "15Gi"}}}})
        );
    }

    #[test]
    fn redis_resources_patch() {
        let patch = RedisPatch {
            memory_mb: Some(128),
            ..RedisPatch::default()
        };
        let body = redis_patch(&redis(), &patch).unwrap();
        assert_eq!(
            body["spec"]["template"]["spec"]["containers"],
            json!([{"name": "redis", "resources": {"requests": {"memory": "128M"}}}])
        );
    }

    #[test]
    fn redis_dedicated_switch_replaces_nfs() {
        let patch = RedisPatch {
            is_dedicated_volume: Some(true),
            dedicated_volume_size_gb: Some(10),
            ..RedisPatch::default()
        };
        let body = redis_patch(&redis(), &patch).unwrap();
        assert_eq!(
            body["spec"]["template"]["spec"]["volumes"],
            json!([{"name": "data", "nfs": null, "persistentVolumeClaim": {"claimName": "redis-alice-foo-17"}}])
        );
    }

    #[test]
    fn restart_and_annotation_patches() {
        assert_eq!(
            restart_patch("t2"),
            json!({"spec": {"template": {"metadata": {"annotations": {"cadeploy.io/touch": "t2"}}}}})
        );
        assert_eq!(
            props_annotation_patch("P", None),
            json!({"metadata": {"annotations": {"cadeploy.io/props": "P"}}})
        );
    }

    #[test]
    fn observed_version_is_a_precondition() {
        let patch = AppPatch {
            instances: Some(2),
            ..AppPatch::default()
        };
        let body = app_patch(&app(), &patch, "P", Some("41"));
        assert_eq!(body["metadata"]["resourceVersion"], "41");
        assert_eq!(body["spec"]["replicas"], 2);
        assert_eq!(
            props_annotation_patch("P", Some("41"))["metadata"]["resourceVersion"],
            "41"
        );
    }
}
