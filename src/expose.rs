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

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::RwLock;

use enum_as_inner::EnumAsInner;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::context::RequestContext;
use crate::prelude::*;

pub type Args = Vec<Value>;
pub type Kwargs = Map<String, Value>;

/// A live object served by the daemon. Methods take `&self` access only;
/// mutable state lives behind the object's own interior mutability, which is
/// what lets `single`-mode instances be shared across connections.
pub type ServedInstance = Arc<dyn Any + Send + Sync>;

/// The suspension-resumption primitive behind item streaming: an owned
/// iterator the stream registry keeps alive across follow-up calls.
pub type ItemStream = Box<dyn Iterator<Item = Result<Value>> + Send>;

#[derive(EnumAsInner)]
pub enum CallResult {
    Value(Value),
    Stream(ItemStream),
}

pub type MethodFn =
    Arc<dyn Fn(&ServedInstance, &RequestContext, Args, Kwargs) -> Result<CallResult> + Send + Sync>;
pub type GetterFn = Arc<dyn Fn(&ServedInstance) -> Result<Value> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(&ServedInstance, Value) -> Result<()> + Send + Sync>;
pub type CreatorFn = Arc<dyn Fn() -> Result<ServedInstance> + Send + Sync>;

#[derive(Clone)]
pub struct MethodDef {
    pub(crate) func: MethodFn,
    pub exposed: bool,
    pub oneway: bool,
    pub callback: bool,
}

#[derive(Clone)]
pub struct PropertyDef {
    pub(crate) get: Option<GetterFn>,
    pub(crate) set: Option<SetterFn>,
    pub exposed: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InstanceMode {
    Single,
    Session,
    PerCall,
}

// Magic names that stay private even though they match the public __x__
// shape.
const PRIVATE_DUNDER_NAMES: &[&str] = &[
    "__init__", "__call__", "__new__", "__del__", "__repr__", "__unicode__",
    "__str__", "__format__", "__nonzero__", "__bool__", "__coerce__",
    "__cmp__", "__eq__", "__ne__", "__hash__",
    "__dir__", "__enter__", "__exit__", "__copy__", "__deepcopy__", "__sizeof__",
    "__getattr__", "__setattr__", "__hasattr__", "__getattribute__", "__delattr__",
    "__instancecheck__", "__subclasscheck__", "__getinitargs__", "__getnewargs__",
    "__getstate__", "__setstate__", "__reduce__", "__reduce_ex__",
    "__getstate_for_dict__", "__setstate_from_dict__", "__subclasshook__",
];

/// Whether a member name is private and therefore never remotely visible.
/// Leading-underscore names are private, except magic `__x__` names longer
/// than 4 chars, which are public unless deny-listed.
pub fn is_private_name(name: &str) -> bool {
    if PRIVATE_DUNDER_NAMES.contains(&name) {
        return true;
    }
    if !name.starts_with('_') {
        return false;
    }
    if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
        return false;
    }
    true
}

/// The descriptor table for one registered type: what the original encodes
/// with `@expose`/`@oneway`/`@callback`/`@behavior` markers, carried here as
/// explicit per-member flags. Built once with [`ExposedClass::builder`] and
/// shared immutably; only the registration back-references and the attached
/// instancing policy are interior-mutable.
pub struct ExposedClass {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    methods: HashMap<String, MethodDef>,
    properties: HashMap<String, PropertyDef>,
    constructor: Option<CreatorFn>,
    instancing: RwLock<Option<(InstanceMode, Option<CreatorFn>)>>,
    registered_id: RwLock<Option<String>>,
    daemon_location: RwLock<Option<String>>,
}

impl std::fmt::Debug for ExposedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposedClass")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Identity key for per-class bookkeeping (session bags, singleton slots,
/// the metadata cache).
pub(crate) fn class_key(class: &Arc<ExposedClass>) -> usize {
    Arc::as_ptr(class) as usize
}

impl ExposedClass {
    pub fn builder<T: Any + Send + Sync>(name: &str) -> ExposedClassBuilder<T> {
        ExposedClassBuilder {
            name: name.to_owned(),
            methods: HashMap::new(),
            properties: HashMap::new(),
            constructor: None,
            instancing: None,
            oneway_tags: Vec::new(),
            callback_tags: Vec::new(),
            unexposed_tags: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&String, &MethodDef)> {
        self.methods.iter()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&String, &PropertyDef)> {
        self.properties.iter()
    }

    pub fn instancing(&self) -> Option<InstanceMode> {
        self.instancing.read().expect("instancing lock").as_ref().map(|i| i.0)
    }

    /// Classes registered without an explicit policy get the default, one
    /// instance per session.
    pub(crate) fn attach_default_instancing(&self) {
        let mut instancing = self.instancing.write().expect("instancing lock");
        if instancing.is_none() {
            *instancing = Some((InstanceMode::Session, None));
        }
    }

    pub(crate) fn effective_instancing(&self) -> (InstanceMode, Option<CreatorFn>) {
        self.instancing
            .read()
            .expect("instancing lock")
            .clone()
            .unwrap_or((InstanceMode::Session, None))
    }

    /// Materialize a fresh instance: the instancing creator when present,
    /// else the constructor. A creator returning some other concrete type is
    /// rejected.
    pub fn create_instance(&self) -> Result<ServedInstance> {
        let (_, creator) = self.effective_instancing();
        let instance = match creator.or_else(|| self.constructor.clone()) {
            Some(create) => create()
                .logged(loc!())
                .context(loc!(), "could not create object instance")?,
            None => bail!(PyroError::Daemon(format!(
                "class {} has no constructor or instance creator",
                self.name
            ))),
        };
        if instance.as_ref().type_id() != self.type_id {
            bail!(PyroError::Type(
                "instance creator returned object of different type".into()
            ));
        }
        Ok(instance)
    }

    pub(crate) fn check_instance(&self, instance: &ServedInstance) -> Result<()> {
        if instance.as_ref().type_id() != self.type_id {
            bail!(PyroError::Type(format!(
                "instance is not a {}",
                self.type_name
            )));
        }
        Ok(())
    }

    pub fn registered_id(&self) -> Option<String> {
        self.registered_id.read().expect("id lock").clone()
    }

    pub fn daemon_location(&self) -> Option<String> {
        self.daemon_location.read().expect("location lock").clone()
    }

    pub(crate) fn stamp_registration(&self, id: &str, location: &str) {
        *self.registered_id.write().expect("id lock") = Some(id.to_owned());
        *self.daemon_location.write().expect("location lock") = Some(location.to_owned());
    }

    pub(crate) fn scrub_registration(&self) {
        *self.registered_id.write().expect("id lock") = None;
        *self.daemon_location.write().expect("location lock") = None;
    }

    /// The tagged value form a method returns to hand out a reference to
    /// this object. With AUTOPROXY enabled the serializer rewrites it into a
    /// full proxy; otherwise it travels as this plain tagged map.
    pub fn reference(&self) -> Result<Value> {
        let id = self
            .registered_id()
            .ok_or_else(|| anyhow!(PyroError::Daemon("object isn't registered".into())))?;
        Ok(json!({"__class__": self.name, "__pyroid__": id}))
    }
}

fn downcast<T: Any>(instance: &ServedInstance) -> Result<&T> {
    instance.downcast_ref::<T>().ok_or_else(|| {
        anyhow!(PyroError::Daemon(
            "registered instance has unexpected type".into()
        ))
    })
}

/// Builds the descriptor table for a concrete served type `T`.
///
/// Members added with `method`/`property` carry the exposed tag, mirroring
/// source that applies the expose marker member by member; `unexposed`
/// removes the tag (such members stay reachable for reflection with
/// `only_exposed = false` but are never remotely callable). `oneway` and
/// `callback` tag existing methods. All validation happens in `build`.
pub struct ExposedClassBuilder<T> {
    name: String,
    methods: HashMap<String, MethodDef>,
    properties: HashMap<String, PropertyDef>,
    constructor: Option<CreatorFn>,
    instancing: Option<(InstanceMode, Option<CreatorFn>)>,
    oneway_tags: Vec<String>,
    callback_tags: Vec<String>,
    unexposed_tags: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> ExposedClassBuilder<T> {
    pub fn constructor(mut self, create: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.constructor = Some(Arc::new(move || Ok(Arc::new(create()) as ServedInstance)));
        self
    }

    pub fn method(
        self,
        name: &str,
        f: impl Fn(&T, Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.method_with_context(name, move |obj, _ctx, vargs, kwargs| f(obj, vargs, kwargs))
    }

    pub fn method_with_context(
        mut self,
        name: &str,
        f: impl Fn(&T, &RequestContext, Args, Kwargs) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        let func: MethodFn = Arc::new(move |instance, ctx, vargs, kwargs| {
            Ok(CallResult::Value(f(downcast(instance)?, ctx, vargs, kwargs)?))
        });
        self.methods.insert(
            name.to_owned(),
            MethodDef {
                func,
                exposed: true,
                oneway: false,
                callback: false,
            },
        );
        self
    }

    /// A method whose result is streamed to the caller item by item instead
    /// of being serialized whole.
    pub fn stream_method(
        mut self,
        name: &str,
        f: impl Fn(&T, Args, Kwargs) -> Result<ItemStream> + Send + Sync + 'static,
    ) -> Self {
        let func: MethodFn = Arc::new(move |instance, _ctx, vargs, kwargs| {
            Ok(CallResult::Stream(f(downcast(instance)?, vargs, kwargs)?))
        });
        self.methods.insert(
            name.to_owned(),
            MethodDef {
                func,
                exposed: true,
                oneway: false,
                callback: false,
            },
        );
        self
    }

    pub fn property(mut self, name: &str, get: impl Fn(&T) -> Result<Value> + Send + Sync + 'static) -> Self {
        let get: GetterFn = Arc::new(move |instance| get(downcast(instance)?));
        self.properties.insert(
            name.to_owned(),
            PropertyDef {
                get: Some(get),
                set: None,
                exposed: true,
            },
        );
        self
    }

    pub fn property_rw(
        mut self,
        name: &str,
        get: impl Fn(&T) -> Result<Value> + Send + Sync + 'static,
        set: impl Fn(&T, Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        let get: GetterFn = Arc::new(move |instance| get(downcast(instance)?));
        let set: SetterFn = Arc::new(move |instance, value| set(downcast(instance)?, value));
        self.properties.insert(
            name.to_owned(),
            PropertyDef {
                get: Some(get),
                set: Some(set),
                exposed: true,
            },
        );
        self
    }

    pub fn oneway(mut self, name: &str) -> Self {
        self.oneway_tags.push(name.to_owned());
        self
    }

    pub fn callback(mut self, name: &str) -> Self {
        self.callback_tags.push(name.to_owned());
        self
    }

    pub fn unexposed(mut self, name: &str) -> Self {
        self.unexposed_tags.push(name.to_owned());
        self
    }

    pub fn behavior(mut self, mode: InstanceMode) -> Self {
        self.instancing = Some((mode, None));
        self
    }

    pub fn behavior_with_creator(
        mut self,
        mode: InstanceMode,
        creator: impl Fn() -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        let creator: CreatorFn = Arc::new(move || Ok(Arc::new(creator()?) as ServedInstance));
        self.instancing = Some((mode, Some(creator)));
        self
    }

    /// Escape hatch for creators not tied to the builder's type parameter.
    /// Their results still have to pass the instance-of check at creation
    /// time.
    pub fn behavior_with_dynamic_creator(mut self, mode: InstanceMode, creator: CreatorFn) -> Self {
        self.instancing = Some((mode, Some(creator)));
        self
    }

    pub fn build(mut self) -> Result<Arc<ExposedClass>> {
        for name in self.methods.keys().chain(self.properties.keys()) {
            if is_private_name(name) {
                bail!(PyroError::Attribute(format!(
                    "exposing private names (starting with _) is not allowed: {name}"
                )));
            }
        }
        for tag in &self.oneway_tags {
            self.methods
                .get_mut(tag)
                .ok_or_else(|| tag_error("oneway", tag))?
                .oneway = true;
        }
        for tag in &self.callback_tags {
            self.methods
                .get_mut(tag)
                .ok_or_else(|| tag_error("callback", tag))?
                .callback = true;
        }
        for tag in &self.unexposed_tags {
            if let Some(method) = self.methods.get_mut(tag) {
                method.exposed = false;
            } else if let Some(property) = self.properties.get_mut(tag) {
                property.exposed = false;
            } else {
                return Err(tag_error("unexposed", tag));
            }
        }
        Ok(Arc::new(ExposedClass {
            name: self.name,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            methods: self.methods,
            properties: self.properties,
            constructor: self.constructor,
            instancing: RwLock::new(self.instancing),
            registered_id: RwLock::new(None),
            daemon_location: RwLock::new(None),
        }))
    }
}

fn tag_error(tag: &str, name: &str) -> anyhow::Error {
    anyhow!(PyroError::Daemon(format!(
        "{tag} tag names an unknown member: {name}"
    )))
}
