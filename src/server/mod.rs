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
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::config::ServerType;
use crate::connection::ClientConnection;
use crate::connection::ConnId;
use crate::expose::ExposedClass;
use crate::expose::InstanceMode;
use crate::expose::ServedInstance;
use crate::expose::class_key;
use crate::prelude::*;
use crate::protocol::ANNOTATION_CORRELATION;
use crate::protocol::Annotations;
use crate::reflect;
use crate::reflect::ExposedMembers;
use crate::serializers::SerializerRegistry;
use crate::streams::StreamRegistry;
use crate::transport;
use crate::transport::Listener;
use crate::uri::PyroUri;

pub mod dispatch;
pub mod introspection;

/// The reserved id of the daemon's own introspection object. Present for
/// the daemon's full lifetime, never unregisterable.
pub const DAEMON_NAME: &str = "Pyro.Daemon";

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// One registration: the descriptor table, plus a pinned instance when a
/// live object (rather than a class) was registered. Pinned instances are
/// used for every call; class entries are materialized per their instancing
/// policy.
pub struct RegisteredEntry {
    pub class: Arc<ExposedClass>,
    pub pinned: Option<ServedInstance>,
}

/// The overridable server behaviors. Default: every handshake is accepted
/// with a `"hello"` greeting, disconnects and housekeeping do nothing, and
/// no extra annotations are attached to replies.
pub trait DaemonHooks: Send + Sync {
    /// Accept or deny a connecting client. The returned value is embedded
    /// in the CONNECTOK payload; any error denies the connection.
    fn validate_handshake(&self, _peer: &str, _data: &Value) -> Result<Value> {
        Ok(json!("hello"))
    }

    fn client_disconnect(&self, _client: ConnId) {}

    /// Called every few seconds by the running server loop.
    fn housekeeping(&self) {}

    /// Extra annotations for every reply this daemon sends.
    fn annotations(&self) -> Annotations {
        Annotations::new()
    }
}

pub struct DefaultHooks;

impl DaemonHooks for DefaultHooks {}

/// Either a registered object's id or the object itself; most registry
/// operations accept both.
pub enum ObjectRef<'a> {
    Id(&'a str),
    Object(&'a Arc<ExposedClass>),
}

impl<'a> From<&'a str> for ObjectRef<'a> {
    fn from(id: &'a str) -> Self {
        ObjectRef::Id(id)
    }
}

impl<'a> From<&'a String> for ObjectRef<'a> {
    fn from(id: &'a String) -> Self {
        ObjectRef::Id(id)
    }
}

impl<'a> From<&'a Arc<ExposedClass>> for ObjectRef<'a> {
    fn from(class: &'a Arc<ExposedClass>) -> Self {
        ObjectRef::Object(class)
    }
}

/// The daemon: server-side state and the dispatch logic for incoming remote
/// calls. The I/O substrate (transport module) drives it through three
/// entry points: `handshake`, `handle_request` and `client_disconnect`.
pub struct Daemon {
    pub(crate) config: Config,
    pub(crate) hooks: Box<dyn DaemonHooks>,
    location: String,
    nat_location: Option<String>,
    objects: Mutex<HashMap<String, RegisteredEntry>>,
    single_instances: Mutex<HashMap<usize, ServedInstance>>,
    pub(crate) streams: StreamRegistry,
    pub(crate) serializers: SerializerRegistry,
    listener: Mutex<Option<Listener>>,
    pub(crate) must_shutdown: Arc<AtomicBool>,
    loop_running: Mutex<bool>,
    loop_stopped: Condvar,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_hooks(config, Box::new(DefaultHooks))
    }

    pub fn with_hooks(config: Config, hooks: Box<dyn DaemonHooks>) -> Result<Arc<Self>> {
        config.validate().location(loc!())?;
        let serializers = SerializerRegistry::with_accepted_names(&config.serializers_accepted)
            .location(loc!())?;
        let (listener, location) = transport::bind(&config).location(loc!())?;
        debug!("created daemon on {location} (pid {})", std::process::id());

        let nat_location = match (&config.nathost, config.natport) {
            (Some(nathost), Some(natport)) => {
                // NAT port 0 exposes the actually-bound port.
                let natport = if natport == 0 {
                    location
                        .rsplit_once(':')
                        .and_then(|(_, port)| port.parse::<u16>().ok())
                        .ok_or_else(|| {
                            anyhow!(PyroError::Daemon(
                                "cannot derive NAT port from a unix socket location".into()
                            ))
                        })?
                } else {
                    natport
                };
                Some(format!("{nathost}:{natport}"))
            },
            _ => None,
        };
        if let Some(nat) = &nat_location {
            debug!("NAT address is {nat}");
        }

        let daemon = Arc::new(Self {
            config,
            hooks,
            location,
            nat_location,
            objects: Mutex::new(HashMap::new()),
            single_instances: Mutex::new(HashMap::new()),
            streams: StreamRegistry::new(),
            serializers,
            listener: Mutex::new(Some(listener)),
            must_shutdown: Arc::new(AtomicBool::new(false)),
            loop_running: Mutex::new(false),
            loop_stopped: Condvar::new(),
        });

        let class = introspection::daemon_object_class().location(loc!())?;
        let instance: ServedInstance = Arc::new(introspection::DaemonObject {
            daemon: Arc::downgrade(&daemon),
        });
        class.attach_default_instancing();
        class.stamp_registration(DAEMON_NAME, &daemon.location);
        daemon.objects_lock().insert(
            DAEMON_NAME.to_owned(),
            RegisteredEntry {
                class,
                pinned: Some(instance),
            },
        );
        Ok(daemon)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn nat_location(&self) -> Option<&str> {
        self.nat_location.as_deref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn objects_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegisteredEntry>> {
        self.objects.lock().expect("object registry lock")
    }

    /// Register a class; instances are materialized per its instancing
    /// policy (attached as the default `session` policy when absent).
    /// Returns the object's URI.
    pub fn register(&self, class: Arc<ExposedClass>, object_id: Option<&str>, force: bool) -> Result<PyroUri> {
        class.attach_default_instancing();
        self.register_entry(class, None, object_id, force)
    }

    /// Register a live instance of `class`: that one object serves every
    /// call, regardless of the class's instancing policy.
    pub fn register_instance(
        &self,
        class: Arc<ExposedClass>,
        instance: ServedInstance,
        object_id: Option<&str>,
        force: bool,
    ) -> Result<PyroUri> {
        class.check_instance(&instance).location(loc!())?;
        self.register_entry(class, Some(instance), object_id, force)
    }

    fn register_entry(
        &self,
        class: Arc<ExposedClass>,
        pinned: Option<ServedInstance>,
        object_id: Option<&str>,
        force: bool,
    ) -> Result<PyroUri> {
        let object_id = match object_id {
            Some(id) => id.to_owned(),
            None => format!("obj_{}", Uuid::new_v4().simple()),
        };
        {
            let mut objects = self.objects_lock();
            if !force {
                if class.registered_id().is_some() {
                    bail!(PyroError::Daemon("object or class already has a Pyro id".into()));
                }
                if objects.contains_key(&object_id) {
                    bail!(PyroError::Daemon(
                        "an object or class is already registered with that id".into()
                    ));
                }
            }
            class.stamp_registration(&object_id, &self.location);
            objects.insert(
                object_id.clone(),
                RegisteredEntry {
                    class: Arc::clone(&class),
                    pinned,
                },
            );
        }
        if self.config.autoproxy {
            self.install_autoproxy_replacement(&class);
        }
        self.uri_for(&object_id, true)
    }

    // When a reply payload carries a reference to this registered type, the
    // serializer rewrites it into its URI-carrying proxy form. Installed
    // per registration, never removed: other objects of the same type may
    // still be registered.
    fn install_autoproxy_replacement(&self, class: &Arc<ExposedClass>) {
        let class_ref = Arc::downgrade(class);
        self.serializers.register_type_replacement(
            class.name(),
            Arc::new(move |map| {
                let class = class_ref.upgrade()?;
                let object_id = map
                    .get("__pyroid__")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .or_else(|| class.registered_id())?;
                let location = class.daemon_location()?;
                let members = reflect::get_exposed_members(&class, true, true, true);
                Some(json!({
                    "__class__": "Pyro.Proxy",
                    "state": [
                        PyroUri::new(object_id, location).to_string(),
                        &members.methods,
                        &members.oneway,
                        &members.attrs,
                    ],
                }))
            }),
        );
    }

    fn resolve_id(&self, object: ObjectRef) -> Result<String> {
        match object {
            ObjectRef::Id(id) => Ok(id.to_owned()),
            ObjectRef::Object(class) => class
                .registered_id()
                .ok_or_else(|| anyhow!(PyroError::Daemon("object isn't registered".into()))),
        }
    }

    /// Remove a registration. The daemon's own introspection object is
    /// silently skipped; unregistering something unknown is a no-op.
    pub fn unregister<'a>(&self, object: impl Into<ObjectRef<'a>>) -> Result<()> {
        let object_id = self.resolve_id(object.into()).location(loc!())?;
        if object_id == DAEMON_NAME {
            return Ok(());
        }
        if let Some(entry) = self.objects_lock().remove(&object_id) {
            entry.class.scrub_registration();
            self.single_instances
                .lock()
                .expect("single instance lock")
                .remove(&class_key(&entry.class));
        }
        Ok(())
    }

    /// A URI for the given object or object id. Unregistered ids still
    /// produce a URI (it is just a string); unregistered objects fail. NAT
    /// translation applies when requested and configured.
    pub fn uri_for<'a>(&self, object: impl Into<ObjectRef<'a>>, nat: bool) -> Result<PyroUri> {
        let object_id = self.resolve_id(object.into()).location(loc!())?;
        let location = if nat {
            self.nat_location.as_deref().unwrap_or(&self.location)
        } else {
            &self.location
        };
        Ok(PyroUri::new(object_id, location))
    }

    /// The proxy value form for a registered object, with its metadata
    /// embedded.
    pub fn proxy_for<'a>(&self, object: impl Into<ObjectRef<'a>>, nat: bool) -> Result<Value> {
        let uri = self.uri_for(object, nat).location(loc!())?;
        let members = {
            let objects = self.objects_lock();
            let entry = objects.get(&uri.object_id).ok_or_else(|| {
                anyhow!(PyroError::Daemon("object isn't registered in this daemon".into()))
            })?;
            reflect::get_exposed_members(&entry.class, true, false, true)
        };
        Ok(json!({
            "__class__": "Pyro.Proxy",
            "state": [uri.to_string(), &members.methods, &members.oneway, &members.attrs],
        }))
    }

    /// Drop the cached exposed-member shapes for an object whose members
    /// changed; the next reflection recomputes them.
    pub fn reset_metadata_cache<'a>(&self, object: impl Into<ObjectRef<'a>>) -> Result<()> {
        let object_id = self.resolve_id(object.into()).location(loc!())?;
        if let Some(entry) = self.objects_lock().get(&object_id) {
            reflect::reset_exposed_members(&entry.class, true, true);
            reflect::reset_exposed_members(&entry.class, true, false);
        }
        Ok(())
    }

    pub fn registered(&self) -> Vec<String> {
        self.objects_lock().keys().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects_lock().len()
    }

    pub(crate) fn entry_for(&self, object_id: &str) -> Option<(Arc<ExposedClass>, Option<ServedInstance>)> {
        self.objects_lock()
            .get(object_id)
            .map(|entry| (Arc::clone(&entry.class), entry.pinned.clone()))
    }

    /// Exposed-member metadata for a registered object, as sent to proxies.
    pub fn get_metadata(&self, object_id: &str, as_lists: bool) -> Result<Arc<ExposedMembers>> {
        let Some((class, _)) = self.entry_for(object_id) else {
            debug!("unknown object requested: {object_id}");
            bail!(PyroError::Daemon("unknown object".into()));
        };
        let members = reflect::get_exposed_members(&class, true, as_lists, true);
        if members.is_empty() {
            warn!(
                "class {:?} doesn't expose any methods or attributes, check its descriptor table",
                class.name()
            );
        }
        Ok(members)
    }

    /// Resolve a class entry to the instance that serves this call.
    pub(crate) fn instance_for(
        &self,
        class: &Arc<ExposedClass>,
        conn: &mut ClientConnection,
    ) -> Result<ServedInstance> {
        let key = class_key(class);
        let (mode, _) = class.effective_instancing();
        match mode {
            InstanceMode::Single => {
                {
                    let singles = self.single_instances.lock().expect("single instance lock");
                    if let Some(instance) = singles.get(&key) {
                        return Ok(Arc::clone(instance));
                    }
                }
                debug!("instancemode single: creating new object for {}", class.name());
                let instance = class.create_instance().location(loc!())?;
                let mut singles = self.single_instances.lock().expect("single instance lock");
                Ok(Arc::clone(singles.entry(key).or_insert(instance)))
            },
            InstanceMode::Session => {
                if let Some(instance) = conn.session_instance(key) {
                    return Ok(instance);
                }
                debug!("instancemode session: creating new object for {}", class.name());
                let instance = class.create_instance().location(loc!())?;
                conn.store_session_instance(key, Arc::clone(&instance));
                Ok(instance)
            },
            InstanceMode::PerCall => {
                debug!("instancemode percall: creating new object for {}", class.name());
                class.create_instance().location(loc!())
            },
        }
    }

    /// Periodic cleanup: sweep the stream registry, then run the user hook.
    /// No-op while shutting down.
    pub fn housekeeping(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.streams.sweep(
            Instant::now(),
            self.config.stream_lifetime(),
            self.config.stream_linger(),
        );
        self.hooks.housekeeping();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.must_shutdown.load(Ordering::Acquire)
    }

    /// Reply annotations: the request's correlation id plus whatever the
    /// hooks contribute.
    pub(crate) fn reply_annotations(&self, correlation_id: Option<Uuid>) -> Annotations {
        let mut annotations = self.hooks.annotations();
        if let Some(correlation_id) = correlation_id {
            annotations.insert(
                ANNOTATION_CORRELATION.to_owned(),
                correlation_id.as_bytes().to_vec(),
            );
        }
        annotations
    }

    pub fn info(&self) -> String {
        let servertype = match self.config.servertype {
            ServerType::Thread => "thread",
            ServerType::Multiplex => "multiplex",
        };
        format!(
            "{DAEMON_NAME} bound on {}, NAT {}, {} objects registered. Servertype: {servertype}",
            self.location,
            self.nat_location.as_deref().unwrap_or("None"),
            self.object_count(),
        )
    }

    /// Serve requests until `shutdown` is called from another thread.
    pub fn request_loop(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or_else(|| anyhow!(PyroError::Generic("cannot reuse this daemon".into())))?;
        info!("daemon {} entering requestloop", self.location);
        *self.loop_running.lock().expect("loop flag lock") = true;
        let result = match self.config.servertype {
            ServerType::Thread => transport::threaded::run(self, listener),
            ServerType::Multiplex => transport::multiplex::run(self, listener),
        };
        *self.loop_running.lock().expect("loop flag lock") = false;
        self.loop_stopped.notify_all();
        debug!("daemon exits requestloop");
        result
    }

    /// Cleanly terminate a daemon running in its request loop: drop the
    /// streams, raise the must-stop flag and wait (bounded) for the loop to
    /// acknowledge. In-flight dispatches finish on their own.
    pub fn shutdown(&self) {
        debug!("daemon shutting down");
        self.streams.clear();
        self.must_shutdown.store(true, Ordering::Release);
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        let mut running = self.loop_running.lock().expect("loop flag lock");
        while *running {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                warn!("request loop did not acknowledge shutdown in time");
                break;
            }
            let (guard, _) = self
                .loop_stopped
                .wait_timeout(running, timeout)
                .expect("loop flag lock");
            running = guard;
        }
    }

    /// Release the listening socket and all registry state without waiting
    /// for a loop acknowledgment.
    pub fn close(&self) {
        self.must_shutdown.store(true, Ordering::Release);
        self.streams.clear();
        if self.listener.lock().expect("listener lock").take().is_some() {
            debug!("daemon closing");
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.close();
    }
}
