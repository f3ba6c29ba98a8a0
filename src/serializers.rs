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

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::errors::RemoteException;
use crate::prelude::*;

// Payloads below this size never win anything from zstd.
const COMPRESSION_MIN_SIZE: usize = 100;

/// A wire codec. Codecs only turn values into bytes and back; compression
/// and the type-replacement pass are layered on top by [`Serializer`].
pub trait Codec: Send + Sync {
    fn serializer_id(&self) -> u16;
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serializer_id(&self) -> u16 {
        2
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| PyroError::Serialization(format!("json encode failed: {e}")).into())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| PyroError::Serialization(format!("json decode failed: {e}")).into())
    }
}

pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn serializer_id(&self) -> u16 {
        4
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value)
            .map_err(|e| PyroError::Serialization(format!("msgpack encode failed: {e}")).into())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| PyroError::Serialization(format!("msgpack decode failed: {e}")).into())
    }
}

/// Replaces a tagged map value (matched on its `__class__` tag) with another
/// value during serialization. Returning None leaves the value untouched.
pub type ReplacerFn = Arc<dyn Fn(&Map<String, Value>) -> Option<Value> + Send + Sync>;

type ReplacerMap = Arc<RwLock<HashMap<String, ReplacerFn>>>;

/// One codec plus the registry-wide replacement table: the handle the daemon
/// actually serializes and deserializes with.
#[derive(Clone)]
pub struct Serializer {
    codec: Arc<dyn Codec>,
    replacers: ReplacerMap,
}

impl Serializer {
    fn new(codec: Arc<dyn Codec>, replacers: ReplacerMap) -> Self {
        Self { codec, replacers }
    }

    pub fn serializer_id(&self) -> u16 {
        self.codec.serializer_id()
    }

    pub fn name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn serialize_data(&self, value: &Value, compress: bool) -> Result<(Vec<u8>, bool)> {
        let value = apply_replacements(value, &self.replacers.read().expect("replacer lock"));
        let bytes = self.codec.encode(&value).location(loc!())?;
        Ok(maybe_compress(bytes, compress))
    }

    pub fn deserialize_data(&self, bytes: &[u8], compressed: bool) -> Result<Value> {
        if compressed {
            let bytes = zstd::stream::decode_all(bytes)
                .map_err(|e| PyroError::Serialization(format!("decompression failed: {e}")))?;
            self.codec.decode(&bytes)
        } else {
            self.codec.decode(bytes)
        }
    }

    pub fn serialize_call(
        &self,
        object_id: &str,
        method: &str,
        vargs: Vec<Value>,
        kwargs: Map<String, Value>,
        compress: bool,
    ) -> Result<(Vec<u8>, bool)> {
        self.serialize_data(&json!([object_id, method, vargs, kwargs]), compress)
    }

    pub fn deserialize_call(
        &self,
        bytes: &[u8],
        compressed: bool,
    ) -> Result<(String, String, Vec<Value>, Map<String, Value>)> {
        let value = self.deserialize_data(bytes, compressed).location(loc!())?;
        let invalid = || PyroError::Serialization("invalid call payload".into());
        let parts = value.as_array().ok_or_else(invalid)?;
        let [object_id, method, vargs, kwargs] = parts.as_slice() else {
            bail!(invalid());
        };
        Ok((
            object_id.as_str().ok_or_else(invalid)?.to_owned(),
            method.as_str().ok_or_else(invalid)?.to_owned(),
            vargs.as_array().ok_or_else(invalid)?.clone(),
            kwargs.as_object().ok_or_else(invalid)?.clone(),
        ))
    }

    /// Serialize an exception payload, substituting a generic error when the
    /// exception itself will not serialize.
    pub fn serialize_exception(
        &self,
        exc: &RemoteException,
        compress: bool,
    ) -> Result<(Vec<u8>, bool)> {
        match self.serialize_data(&exc.to_value(), compress) {
            Ok(out) => Ok(out),
            Err(inner) => {
                let substitute = RemoteException {
                    exc_type: "PyroError".to_owned(),
                    msg: format!(
                        "Error serializing exception: {inner}. Original exception: {}: {}",
                        exc.exc_type, exc.msg
                    ),
                    traceback: exc.traceback.clone(),
                };
                self.serialize_data(&substitute.to_value(), compress)
                    .location(loc!())
            },
        }
    }
}

fn maybe_compress(bytes: Vec<u8>, compress: bool) -> (Vec<u8>, bool) {
    if compress && bytes.len() > COMPRESSION_MIN_SIZE {
        if let Ok(packed) = zstd::stream::encode_all(&bytes[..], 0) {
            if packed.len() < bytes.len() {
                return (packed, true);
            }
        }
    }
    (bytes, false)
}

fn apply_replacements(value: &Value, replacers: &HashMap<String, ReplacerFn>) -> Value {
    if replacers.is_empty() {
        return value.clone();
    }
    match value {
        Value::Object(map) => {
            if let Some(tag) = map.get("__class__").and_then(Value::as_str) {
                if let Some(replacer) = replacers.get(tag) {
                    if let Some(replacement) = replacer(map) {
                        return replacement;
                    }
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), apply_replacements(v, replacers)))
                    .collect(),
            )
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| apply_replacements(item, replacers))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Codecs by id plus the daemon's accept-list. One registry per daemon.
pub struct SerializerRegistry {
    by_id: HashMap<u16, Arc<dyn Codec>>,
    accepted: HashSet<u16>,
    replacers: ReplacerMap,
}

impl SerializerRegistry {
    /// All known codecs, with the accept-list restricted to the given names.
    pub fn with_accepted_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let codecs: Vec<Arc<dyn Codec>> = vec![Arc::new(JsonCodec), Arc::new(MsgpackCodec)];
        let by_id: HashMap<u16, Arc<dyn Codec>> = codecs
            .into_iter()
            .map(|codec| (codec.serializer_id(), codec))
            .collect();
        let mut accepted = HashSet::new();
        for name in names {
            let name = name.as_ref();
            let codec = by_id
                .values()
                .find(|codec| codec.name() == name)
                .ok_or_else(|| {
                    anyhow!(PyroError::Serialization(format!("unknown serializer: {name}")))
                })?;
            accepted.insert(codec.serializer_id());
        }
        Ok(Self {
            by_id,
            accepted,
            replacers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn by_id(&self, id: u16) -> Result<Serializer> {
        self.by_id
            .get(&id)
            .map(|codec| Serializer::new(Arc::clone(codec), Arc::clone(&self.replacers)))
            .ok_or_else(|| anyhow!(PyroError::Serialization(format!("unknown serializer id: {id}"))))
    }

    pub fn by_name(&self, name: &str) -> Result<Serializer> {
        self.by_id
            .values()
            .find(|codec| codec.name() == name)
            .map(|codec| Serializer::new(Arc::clone(codec), Arc::clone(&self.replacers)))
            .ok_or_else(|| anyhow!(PyroError::Serialization(format!("unknown serializer: {name}"))))
    }

    pub fn check_accepted(&self, id: u16) -> Result<()> {
        if self.accepted.contains(&id) {
            Ok(())
        } else {
            bail!(PyroError::Serialization(format!(
                "message used serializer that is not accepted: {id}"
            )))
        }
    }

    /// Install (or overwrite) the replacement hook for one `__class__` tag.
    /// Replacements apply to every codec in this registry and survive object
    /// unregistration: other registered objects of the same type may still
    /// rely on them.
    pub fn register_type_replacement(&self, class_tag: &str, replacer: ReplacerFn) {
        self.replacers
            .write()
            .expect("replacer lock")
            .insert(class_tag.to_owned(), replacer);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::with_accepted_names(&["json", "msgpack"]).unwrap()
    }

    #[test]
    fn call_round_trips_through_every_accepted_codec() {
        let registry = registry();
        for name in ["json", "msgpack"] {
            let ser = registry.by_name(name).unwrap();
            let kwargs: Map<String, Value> =
                [("flag".to_owned(), json!(true))].into_iter().collect();
            let (bytes, compressed) = ser
                .serialize_call("obj_1", "hello", vec![json!("world"), json!(42)], kwargs.clone(), false)
                .unwrap();
            let (object_id, method, vargs, got_kwargs) =
                ser.deserialize_call(&bytes, compressed).unwrap();
            assert_eq!(object_id, "obj_1");
            assert_eq!(method, "hello");
            assert_eq!(vargs, vec![json!("world"), json!(42)]);
            assert_eq!(got_kwargs, kwargs);
        }
    }

    #[test]
    fn malformed_call_payload_is_a_serialization_error() {
        let ser = registry().by_name("json").unwrap();
        let (bytes, _) = ser.serialize_data(&json!({"not": "a call"}), false).unwrap();
        let err = ser.deserialize_call(&bytes, false).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "SerializationError");
    }

    #[test]
    fn compression_only_kicks_in_when_it_shrinks_the_payload() {
        let ser = registry().by_name("json").unwrap();

        let small = json!("tiny");
        let (_, compressed) = ser.serialize_data(&small, true).unwrap();
        assert!(!compressed);

        let big = json!(vec!["repetitive repetitive repetitive"; 100]);
        let (bytes, compressed) = ser.serialize_data(&big, true).unwrap();
        assert!(compressed);
        assert_eq!(ser.deserialize_data(&bytes, true).unwrap(), big);
    }

    #[test]
    fn accept_list_is_enforced_by_id() {
        let registry = SerializerRegistry::with_accepted_names(&["json"]).unwrap();
        registry.check_accepted(2).unwrap();
        let err = registry.check_accepted(4).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "SerializationError");
        // The codec itself is still available for replying.
        assert!(registry.by_id(4).is_ok());
    }

    #[test]
    fn unknown_accepted_name_fails_construction() {
        assert!(SerializerRegistry::with_accepted_names(&["pickle"]).is_err());
    }

    #[test]
    fn type_replacements_rewrite_tagged_values_recursively() {
        let registry = registry();
        registry.register_type_replacement(
            "Greeter",
            Arc::new(|map| {
                let id = map.get("id")?.as_str()?;
                Some(json!({"__class__": "Pyro.Proxy", "uri": format!("PYRO:{id}@here:1")}))
            }),
        );
        let ser = registry.by_name("json").unwrap();
        let value = json!({"nested": [{"__class__": "Greeter", "id": "obj_9"}]});
        let (bytes, _) = ser.serialize_data(&value, false).unwrap();
        let out = ser.deserialize_data(&bytes, false).unwrap();
        assert_eq!(out["nested"][0]["__class__"], "Pyro.Proxy");
        assert_eq!(out["nested"][0]["uri"], "PYRO:obj_9@here:1");
    }

    struct BrokenCodec;

    impl Codec for BrokenCodec {
        fn serializer_id(&self) -> u16 {
            99
        }

        fn name(&self) -> &'static str {
            "broken"
        }

        fn encode(&self, value: &Value) -> Result<Vec<u8>> {
            if value.get("__class__").and_then(Value::as_str) == Some("ValueError") {
                bail!(PyroError::Serialization("unserializable exception class".into()));
            }
            serde_json::to_vec(value).map_err(Into::into)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Value> {
            serde_json::from_slice(bytes).map_err(Into::into)
        }
    }

    #[test]
    fn unserializable_exception_is_replaced_by_a_generic_error() {
        let ser = Serializer::new(
            Arc::new(BrokenCodec),
            Arc::new(RwLock::new(HashMap::new())),
        );
        let exc = RemoteException {
            exc_type: "ValueError".to_owned(),
            msg: "boom".to_owned(),
            traceback: vec!["line".to_owned()],
        };
        let (bytes, compressed) = ser.serialize_exception(&exc, false).unwrap();
        assert!(!compressed);
        let value = ser.deserialize_data(&bytes, false).unwrap();
        let substitute = RemoteException::from_value(&value).unwrap();
        assert_eq!(substitute.exc_type, "PyroError");
        assert!(substitute.msg.contains("Error serializing exception"));
        assert!(substitute.msg.contains("ValueError: boom"));
    }

    proptest! {
        #[test]
        fn arbitrary_scalar_args_round_trip(
            s in ".*",
            n in any::<i64>(),
            b in any::<bool>(),
        ) {
            let ser = registry().by_name("msgpack").unwrap();
            let vargs = vec![json!(s), json!(n), json!(b), Value::Null];
            let (bytes, compressed) =
                ser.serialize_call("obj", "m", vargs.clone(), Map::new(), true).unwrap();
            let (_, _, got, _) = ser.deserialize_call(&bytes, compressed).unwrap();
            prop_assert_eq!(got, vargs);
        }
    }
}
