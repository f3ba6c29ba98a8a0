// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;

use crate::expose::ExposedClass;
use crate::expose::ServedInstance;
use crate::expose::class_key;
use crate::expose::is_private_name;
use crate::prelude::*;

/// What a class looks like from the outside: the metadata sent to proxies in
/// the handshake reply and by `get_metadata`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExposedMembers {
    pub methods: BTreeSet<String>,
    pub oneway: BTreeSet<String>,
    pub attrs: BTreeSet<String>,
}

impl ExposedMembers {
    pub fn to_value(&self) -> Value {
        json!({
            "methods": self.methods.iter().collect::<Vec<_>>(),
            "oneway": self.oneway.iter().collect::<Vec<_>>(),
            "attrs": self.attrs.iter().collect::<Vec<_>>(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.attrs.is_empty()
    }
}

// Cached per (class identity, only_exposed, as_lists). The value model has
// no set type, so both as_lists shapes render identically; the flag stays in
// the key for wire-protocol fidelity.
type CacheKey = (usize, bool, bool);

static MEMBER_CACHE: LazyLock<Mutex<HashMap<CacheKey, Arc<ExposedMembers>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Compute (and cache) the remotely visible members of a class. Private
/// names never appear; unexposed members appear only when `only_exposed` is
/// false; oneway is always a subset of methods; bare data is not a concept
/// here, properties are the only attribute channel.
pub fn get_exposed_members(
    class: &Arc<ExposedClass>,
    only_exposed: bool,
    as_lists: bool,
    use_cache: bool,
) -> Arc<ExposedMembers> {
    let key = (class_key(class), only_exposed, as_lists);
    if use_cache {
        if let Some(hit) = MEMBER_CACHE.lock().expect("member cache lock").get(&key) {
            return Arc::clone(hit);
        }
    }

    let mut members = ExposedMembers {
        methods: BTreeSet::new(),
        oneway: BTreeSet::new(),
        attrs: BTreeSet::new(),
    };
    for (name, def) in class.methods() {
        if is_private_name(name) {
            continue;
        }
        if def.exposed || !only_exposed {
            members.methods.insert(name.clone());
            if def.oneway {
                members.oneway.insert(name.clone());
            }
        }
    }
    for (name, def) in class.properties() {
        if is_private_name(name) {
            continue;
        }
        if def.exposed || !only_exposed {
            members.attrs.insert(name.clone());
        }
    }

    let members = Arc::new(members);
    MEMBER_CACHE
        .lock()
        .expect("member cache lock")
        .insert(key, Arc::clone(&members));
    members
}

/// Drop one cached shape, forcing recomputation on the next request.
pub fn reset_exposed_members(class: &Arc<ExposedClass>, only_exposed: bool, as_lists: bool) {
    MEMBER_CACHE
        .lock()
        .expect("member cache lock")
        .remove(&(class_key(class), only_exposed, as_lists));
}

fn attribute_error(name: &str) -> anyhow::Error {
    anyhow!(PyroError::Attribute(format!(
        "attempt to access unexposed or unknown remote attribute '{name}'"
    )))
}

/// The `__getattr__` dispatch path: only exposed properties with a getter
/// are readable.
pub fn get_exposed_property_value(
    class: &ExposedClass,
    instance: &ServedInstance,
    name: &str,
) -> Result<Value> {
    if let Some(property) = class.property(name) {
        if property.exposed {
            if let Some(get) = &property.get {
                return get(instance);
            }
        }
    }
    Err(attribute_error(name))
}

/// The `__setattr__` dispatch path: only exposed properties with a setter
/// are writable.
pub fn set_exposed_property_value(
    class: &ExposedClass,
    instance: &ServedInstance,
    name: &str,
    value: Value,
) -> Result<()> {
    if let Some(property) = class.property(name) {
        if property.exposed {
            if let Some(set) = &property.set {
                return set(instance, value);
            }
        }
    }
    Err(attribute_error(name))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::expose::InstanceMode;

    struct Thermostat {
        target: AtomicI64,
    }

    fn thermostat_class() -> Arc<ExposedClass> {
        ExposedClass::builder::<Thermostat>("Thermostat")
            .constructor(|| Thermostat {
                target: AtomicI64::new(20),
            })
            .method("status", |_, _, _| Ok(json!("ok")))
            .method("calibrate", |_, _, _| Ok(Value::Null))
            .unexposed("calibrate")
            .method("alert", |_, _, _| Ok(Value::Null))
            .oneway("alert")
            .property_rw(
                "target",
                |obj| Ok(json!(obj.target.load(Ordering::SeqCst))),
                |obj, value| {
                    let v = value
                        .as_i64()
                        .ok_or_else(|| anyhow!(PyroError::Type("target must be an int".into())))?;
                    obj.target.store(v, Ordering::SeqCst);
                    Ok(())
                },
            )
            .property("model", |_| Ok(json!("TH-1000")))
            .behavior(InstanceMode::Session)
            .build()
            .unwrap()
    }

    #[test]
    fn exposed_members_follow_the_visibility_rules() {
        let class = thermostat_class();
        let members = get_exposed_members(&class, true, false, true);
        let expected_methods: BTreeSet<String> =
            ["status", "alert"].map(String::from).into_iter().collect();
        let expected_oneway: BTreeSet<String> = ["alert"].map(String::from).into_iter().collect();
        let expected_attrs: BTreeSet<String> =
            ["target", "model"].map(String::from).into_iter().collect();
        assert_eq!(members.methods, expected_methods);
        assert_eq!(members.oneway, expected_oneway);
        assert_eq!(members.attrs, expected_attrs);

        let all = get_exposed_members(&class, false, false, true);
        assert!(all.methods.contains("calibrate"));
    }

    #[test]
    fn oneway_is_a_subset_of_methods() {
        let class = thermostat_class();
        for only_exposed in [true, false] {
            let members = get_exposed_members(&class, only_exposed, false, true);
            assert!(members.oneway.is_subset(&members.methods));
        }
    }

    #[test]
    fn reflection_is_pure_and_survives_cache_resets() {
        let class = thermostat_class();
        let first = get_exposed_members(&class, true, true, true);
        let second = get_exposed_members(&class, true, true, true);
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));

        reset_exposed_members(&class, true, true);
        let third = get_exposed_members(&class, true, true, true);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first, third);
    }

    #[test]
    fn metadata_value_renders_sorted_lists() {
        let class = thermostat_class();
        let value = get_exposed_members(&class, true, true, true).to_value();
        assert_eq!(value["methods"], json!(["alert", "status"]));
        assert_eq!(value["oneway"], json!(["alert"]));
        assert_eq!(value["attrs"], json!(["model", "target"]));
    }

    #[test]
    fn property_access_honors_exposure_and_accessors() {
        let class = thermostat_class();
        let instance = class.create_instance().unwrap();

        let value = get_exposed_property_value(&class, &instance, "target").unwrap();
        assert_eq!(value, json!(20));

        set_exposed_property_value(&class, &instance, "target", json!(25)).unwrap();
        assert_eq!(
            get_exposed_property_value(&class, &instance, "target").unwrap(),
            json!(25)
        );

        // model has no setter
        let err = set_exposed_property_value(&class, &instance, "model", json!("x")).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "AttributeError");

        // unknown attribute
        let err = get_exposed_property_value(&class, &instance, "ghost").unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "AttributeError");

        // methods are not attributes
        assert!(get_exposed_property_value(&class, &instance, "status").is_err());
    }
}
