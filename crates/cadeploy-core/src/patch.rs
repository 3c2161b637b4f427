//! Field-level patches over the changeable subset of the props structs.
//!
//! The set of fields that may change after creation is fixed at compile
//! time by [`changeable!`]; everything else (ids, namespaces, the cache
//! timestamp) is immutable for the lifetime of a deployment.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{AppProps, RedisProps};

/// A sparse set of field overrides.
pub trait FieldPatch: Debug + Clone + Default + PartialEq + Serialize + DeserializeOwned {
    /// Names of every field the patch can carry.
    const FIELDS: &'static [&'static str];

    fn is_empty(&self) -> bool;

    /// Names of the fields this patch sets.
    fn changed_fields(&self) -> Vec<&'static str>;
}

/// Props whose changeable fields can be diffed and overlaid.
pub trait Changeable {
    type Patch: FieldPatch;

    /// Patch turning `self` into `target`, or `None` when no changeable
    /// field differs.
    fn diff(&self, target: &Self) -> Option<Self::Patch>;

    fn apply(&mut self, patch: &Self::Patch);
}

macro_rules! changeable {
    (
        $(#[$meta:meta])*
        $props:ident => $patch:ident { $($field:ident : $ty:ty),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $patch {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl FieldPatch for $patch {
            const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }

            fn changed_fields(&self) -> Vec<&'static str> {
                let mut fields = Vec::new();
                $(
                    if self.$field.is_some() {
                        fields.push(stringify!($field));
                    }
                )*
                fields
            }
        }

        impl Changeable for $props {
            type Patch = $patch;

            fn diff(&self, target: &Self) -> Option<$patch> {
                let mut patch = $patch::default();
                $(
                    if self.$field != target.$field {
                        patch.$field = Some(target.$field.clone());
                    }
                )*
                (!patch.is_empty()).then_some(patch)
            }

            fn apply(&mut self, patch: &$patch) {
                $(
                    if let Some(value) = &patch.$field {
                        self.$field = value.clone();
                    }
                )*
            }
        }
    };
}

changeable! {
    /// Changes to the app tier.
    AppProps => AppPatch {
        instances: u32,
        cpu_millis: u32,
        cpu_limit_millis: u32,
        memory_mb: u32,
        memory_limit_mb: u32,
        storage_mb: u32,
        storage_limit_mb: u32,
        egress_limit_mbps: u32,
        pool_key: String,
        pool_value: String,
        is_gvisor: bool,
        is_incubator: bool,
        image: String,
        touch: String,
    }
}

changeable! {
    /// Changes to the cache tier.
    RedisProps => RedisPatch {
        cpu_millis: u32,
        cpu_limit_millis: u32,
        memory_mb: u32,
        memory_limit_mb: u32,
        pool_key: String,
        pool_value: String,
        is_gvisor: bool,
        is_dedicated_volume: bool,
        dedicated_volume_size_gb: u32,
    }
}

impl AppPatch {
    /// True when the patch alters the pod's resource block.
    pub fn touches_resources(&self) -> bool {
        self.cpu_millis.is_some()
            || self.cpu_limit_millis.is_some()
            || self.memory_mb.is_some()
            || self.memory_limit_mb.is_some()
            || self.storage_mb.is_some()
            || self.storage_limit_mb.is_some()
    }
}

impl RedisPatch {
    pub fn touches_resources(&self) -> bool {
        self.cpu_millis.is_some()
            || self.cpu_limit_millis.is_some()
            || self.memory_mb.is_some()
            || self.memory_limit_mb.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures;

    #[test]
    fn identical_props_yield_no_patch() {
        let props = fixtures::props("alice-foo");
        assert_eq!(props.app.diff(&props.app.clone()), None);
        assert_eq!(props.redis.diff(&props.redis.clone()), None);
    }

    #[test]
    fn diff_carries_only_changed_fields() {
        let props = fixtures::props("alice-foo");
        let mut target = props.app.clone();
        target.instances = 3;
        target.image = "app:2".to_string();

        let patch = props.app.diff(&target).unwrap();
        assert_eq!(patch.changed_fields(), vec!["instances", "image"]);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!({"instances": 3, "image": "app:2"})
        );
    }

    #[test]
    fn immutable_fields_are_not_diffed() {
        let props = fixtures::props("alice-foo");
        let mut target = props.redis.clone();
        target.timestamp = "1".to_string();
        assert_eq!(props.redis.diff(&target), None);
    }

    #[test]
    fn apply_overlays_patch() {
        let props = fixtures::props("alice-foo");
        let mut target = props.redis.clone();
        target.memory_mb = 512;
        target.is_dedicated_volume = true;
        let patch = props.redis.diff(&target).unwrap();

        let mut applied = props.redis.clone();
        applied.apply(&patch);
        assert_eq!(applied, target);
        assert!(patch.touches_resources());
    }

    #[test]
    fn field_lists() {
        assert!(AppPatch::FIELDS.contains(&"touch"));
        assert!(!AppPatch::FIELDS.contains(&"id"));
        assert_eq!(RedisPatch::FIELDS.len(), 9);
        assert!(AppPatch::default().is_empty());
    }
}
