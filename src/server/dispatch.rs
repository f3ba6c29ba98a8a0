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

use std::thread;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::connection::ClientConnection;
use crate::context::RequestContext;
use crate::errors;
use crate::errors::RemoteException;
use crate::expose::Args;
use crate::expose::CallResult;
use crate::expose::ExposedClass;
use crate::expose::Kwargs;
use crate::expose::ServedInstance;
use crate::prelude::*;
use crate::protocol::ANNOTATION_STREAM;
use crate::protocol::Annotations;
use crate::protocol::Message;
use crate::protocol::MsgType;
use crate::protocol::flags;
use crate::protocol::log_wiredata;
use crate::reflect;
use crate::server::Daemon;

// Handshake failures before the request's serializer id is known are
// answered with the json codec.
const FALLBACK_SERIALIZER_ID: u16 = 2;

// What the dispatcher knows about the in-flight request when something goes
// wrong: enough to decide whether and how to reply.
struct DispatchState {
    seq: u32,
    serializer_id: u16,
    oneway: bool,
    callback: bool,
    correlation: Option<Uuid>,
}

impl Daemon {
    /// Perform the connection handshake: exactly one CONNECT, answered with
    /// CONNECTOK (carrying the validator's greeting and the requested
    /// object's metadata) or CONNECTFAIL (carrying the error message).
    /// Returns whether the connection may proceed to the invoke loop.
    pub fn handshake(&self, conn: &mut ClientConnection) -> Result<bool> {
        let mut seq = 0;
        let mut serializer_id = FALLBACK_SERIALIZER_ID;
        let mut correlation = None;

        let outcome: Result<(Vec<u8>, bool)> = (|| {
            let msg = conn.recv_message(&[MsgType::Connect])?;
            seq = msg.seq;
            if self.config.logwire {
                log_wiredata("daemon handshake received", &msg);
            }
            self.serializers.check_accepted(msg.serializer_id)?;
            let corr = RequestContext::correlation_from(&msg.annotations);
            correlation = Some(corr);
            conn.correlation_id = Some(corr);
            serializer_id = msg.serializer_id;
            let serializer = self.serializers.by_id(serializer_id)?;
            let data = serializer
                .deserialize_data(&msg.payload, msg.flags & flags::COMPRESSED != 0)
                .location(loc!())?;
            let object_id = data.get("object").and_then(Value::as_str).ok_or_else(|| {
                anyhow!(PyroError::Protocol("handshake is missing the object id".into()))
            })?;
            let handshake_data = data.get("handshake").cloned().unwrap_or(Value::Null);
            let greeting = self.hooks.validate_handshake(conn.peer(), &handshake_data)?;
            // Embedding the metadata here saves the proxy a follow-up call.
            let meta = self.get_metadata(object_id, true).location(loc!())?;
            let payload = json!({"handshake": greeting, "meta": meta.to_value()});
            serializer.serialize_data(&payload, self.config.compression)
        })();

        let (msg_type, payload, compressed) = match outcome {
            Ok((payload, compressed)) => (MsgType::ConnectOk, payload, compressed),
            Err(err) if errors::is_connection_closed(&err) => {
                debug!("handshake failed, connection closed early");
                return Ok(false);
            },
            Err(err) => {
                debug!("handshake failed, reason: {err:?}");
                let serializer = self
                    .serializers
                    .by_id(serializer_id)
                    .unwrap_or_else(|_| self.serializers.by_name("json").expect("json codec"));
                serializer_id = serializer.serializer_id();
                let (payload, compressed) = serializer
                    .serialize_data(&json!(errors::root_message(&err)), false)
                    .location(loc!())?;
                (MsgType::ConnectFail, payload, compressed)
            },
        };

        let mut reply_flags = 0;
        if compressed {
            reply_flags |= flags::COMPRESSED;
        }
        let reply = Message::new(
            msg_type,
            reply_flags,
            seq,
            serializer_id,
            payload,
            self.reply_annotations(correlation),
        );
        if self.config.logwire {
            log_wiredata("daemon handshake response", &reply);
        }
        conn.send_bytes(&reply.to_bytes().location(loc!())?)?;
        Ok(msg_type == MsgType::ConnectOk)
    }

    /// Handle one incoming request. Dispatch failures are wrapped into an
    /// exception reply so the server loop survives them; communication and
    /// security errors (and failures of callback-tagged methods) re-raise
    /// so the substrate can act on them.
    pub fn handle_request(&self, conn: &mut ClientConnection) -> Result<()> {
        let msg = conn.recv_message(&[MsgType::Invoke, MsgType::Ping])?;
        let mut state = DispatchState {
            seq: msg.seq,
            serializer_id: msg.serializer_id,
            oneway: msg.flags & flags::ONEWAY != 0,
            callback: false,
            correlation: None,
        };
        match self.process_request(conn, msg, &mut state) {
            Ok(()) => Ok(()),
            Err(err) if errors::is_connection_closed(&err) => Err(err),
            Err(err) => {
                debug!("Exception occurred while handling request: {err:?}");
                if !state.oneway
                    && (errors::is_serialization_error(&err) || !errors::is_communication_error(&err))
                {
                    let exc = RemoteException::from_error(&err, self.config.detailed_traceback);
                    self.send_exception_response(
                        conn,
                        state.seq,
                        state.serializer_id,
                        &exc,
                        0,
                        Annotations::new(),
                        state.correlation,
                    )?;
                }
                if state.callback
                    || errors::is_communication_error(&err)
                    || errors::is_security_error(&err)
                {
                    return Err(err);
                }
                Ok(())
            },
        }
    }

    /// Disconnect bookkeeping for the substrate: start or skip stream
    /// lingering, then run the user hook.
    pub fn client_disconnect(&self, conn: &mut ClientConnection) {
        debug!(
            "client {:?} disconnected (last correlation {:?})",
            conn.id(),
            conn.correlation_id
        );
        self.streams
            .disconnect(conn.id(), self.config.stream_linger(), Instant::now());
        self.hooks.client_disconnect(conn.id());
    }

    fn process_request(
        &self,
        conn: &mut ClientConnection,
        msg: Message,
        state: &mut DispatchState,
    ) -> Result<()> {
        if self.config.logwire {
            log_wiredata("daemon wiredata received", &msg);
        }
        if msg.msg_type == MsgType::Ping {
            // Same seq back, nothing deserialized: a ping, not an echo.
            let reply = Message::new(
                MsgType::Ping,
                0,
                msg.seq,
                msg.serializer_id,
                b"pong".to_vec(),
                self.reply_annotations(None),
            );
            if self.config.logwire {
                log_wiredata("daemon wiredata sending", &reply);
            }
            return conn.send_bytes(&reply.to_bytes().location(loc!())?);
        }

        let correlation = RequestContext::correlation_from(&msg.annotations);
        state.correlation = Some(correlation);
        conn.correlation_id = Some(correlation);

        self.serializers.check_accepted(msg.serializer_id)?;
        let serializer = self.serializers.by_id(msg.serializer_id)?;
        let (object_id, method, vargs, kwargs) = serializer
            .deserialize_call(&msg.payload, msg.flags & flags::COMPRESSED != 0)
            .location(loc!())?;
        let ctx = RequestContext {
            correlation_id: correlation,
            seq: msg.seq,
            msg_flags: msg.flags,
            serializer_id: msg.serializer_id,
            annotations: msg.annotations.clone(),
            client: conn.id(),
            client_addr: conn.peer().to_owned(),
        };

        let Some((class, pinned)) = self.entry_for(&object_id) else {
            debug!("unknown object requested: {object_id}");
            bail!(PyroError::Daemon("unknown object".into()));
        };
        let instance = match pinned {
            Some(instance) => instance,
            None => self.instance_for(&class, conn).location(loc!())?,
        };

        if msg.flags & flags::BATCH != 0 {
            return self.process_batch(conn, &class, &instance, &ctx, vargs, state);
        }

        let result = match method.as_str() {
            // Direct attribute access: only exposed properties are reachable.
            "__getattr__" => {
                let name = str_arg(&vargs, 0)?;
                CallResult::Value(reflect::get_exposed_property_value(&class, &instance, name)?)
            },
            "__setattr__" => {
                let name = str_arg(&vargs, 0)?;
                let value = vargs.get(1).cloned().ok_or_else(|| {
                    anyhow!(PyroError::Type("__setattr__ takes a name and a value".into()))
                })?;
                reflect::set_exposed_property_value(&class, &instance, name, value)?;
                CallResult::Value(Value::Null)
            },
            _ => {
                let def = resolve_method(&class, &method)?;
                if state.oneway && self.config.oneway_threaded {
                    // Detached worker with a snapshot of the context; the
                    // origin connection may be gone by the time it runs.
                    let func = def.func.clone();
                    let instance = instance.clone();
                    let ctx = ctx.clone();
                    thread::Builder::new()
                        .name("oneway-call".to_owned())
                        .spawn(move || {
                            if let Err(err) = func(&instance, &ctx, vargs, kwargs) {
                                error!("Exception in oneway call: {err:?}");
                            }
                        })
                        .location(loc!())?;
                    return Ok(());
                }
                state.callback = def.callback;
                (def.func)(&instance, &ctx, vargs, kwargs)?
            },
        };

        if state.oneway {
            return Ok(());
        }

        match result {
            CallResult::Value(value) => {
                let (payload, compressed) = serializer
                    .serialize_data(&value, self.config.compression)
                    .location(loc!())?;
                let mut reply_flags = 0;
                if compressed {
                    reply_flags |= flags::COMPRESSED;
                }
                let reply = Message::new(
                    MsgType::Result,
                    reply_flags,
                    msg.seq,
                    serializer.serializer_id(),
                    payload,
                    self.reply_annotations(Some(correlation)),
                );
                if self.config.logwire {
                    log_wiredata("daemon wiredata sending", &reply);
                }
                conn.send_bytes(&reply.to_bytes().location(loc!())?)
            },
            CallResult::Stream(stream) => {
                // Dual encoding keeps clients that predate item streaming
                // working: they just see the protocol error.
                let mut annotations = Annotations::new();
                if self.config.iter_streaming {
                    let stream_id = self.streams.register(stream, conn.id()).location(loc!())?;
                    annotations.insert(ANNOTATION_STREAM.to_owned(), stream_id.into_bytes());
                }
                let exc = RemoteException {
                    exc_type: "ProtocolError".to_owned(),
                    msg: "result of call is an iterator".to_owned(),
                    traceback: Vec::new(),
                };
                self.send_exception_response(
                    conn,
                    msg.seq,
                    serializer.serializer_id(),
                    &exc,
                    flags::ITEMSTREAMRESULT,
                    annotations,
                    Some(correlation),
                )
            },
        }
    }

    // Batched calls: process in request order, stop at the first failure and
    // append it as an exception wrapper. Streaming results are not supported
    // inside a batch.
    fn process_batch(
        &self,
        conn: &mut ClientConnection,
        class: &std::sync::Arc<ExposedClass>,
        instance: &ServedInstance,
        ctx: &RequestContext,
        items: Args,
        state: &mut DispatchState,
    ) -> Result<()> {
        let mut results: Vec<Value> = Vec::new();
        for item in items {
            let outcome = parse_batch_item(&item).and_then(|(name, vargs, kwargs)| {
                let def = resolve_method(class, &name)?;
                (def.func)(instance, ctx, vargs, kwargs)
            });
            match outcome {
                Ok(CallResult::Value(value)) => results.push(value),
                Ok(CallResult::Stream(_)) => {
                    let exc = RemoteException {
                        exc_type: "ProtocolError".to_owned(),
                        msg: "result of batched call is an iterator".to_owned(),
                        traceback: Vec::new(),
                    };
                    results.push(exc.to_value());
                    break;
                },
                Err(err) => {
                    debug!("Exception occurred while handling batched request: {err:?}");
                    results.push(
                        RemoteException::from_error(&err, self.config.detailed_traceback)
                            .to_value(),
                    );
                    break;
                },
            }
        }
        if state.oneway {
            return Ok(());
        }

        let serializer = self.serializers.by_id(state.serializer_id)?;
        let (payload, compressed) = serializer
            .serialize_data(&Value::Array(results), self.config.compression)
            .location(loc!())?;
        let mut reply_flags = flags::BATCH;
        if compressed {
            reply_flags |= flags::COMPRESSED;
        }
        let reply = Message::new(
            MsgType::Result,
            reply_flags,
            state.seq,
            serializer.serializer_id(),
            payload,
            self.reply_annotations(state.correlation),
        );
        if self.config.logwire {
            log_wiredata("daemon wiredata sending", &reply);
        }
        conn.send_bytes(&reply.to_bytes().location(loc!())?)
    }

    fn send_exception_response(
        &self,
        conn: &mut ClientConnection,
        seq: u32,
        serializer_id: u16,
        exc: &RemoteException,
        extra_flags: u16,
        extra_annotations: Annotations,
        correlation: Option<Uuid>,
    ) -> Result<()> {
        let serializer = self
            .serializers
            .by_id(serializer_id)
            .unwrap_or_else(|_| self.serializers.by_name("json").expect("json codec"));
        let (payload, compressed) = serializer
            .serialize_exception(exc, self.config.compression)
            .location(loc!())?;
        let mut reply_flags = flags::EXCEPTION | extra_flags;
        if compressed {
            reply_flags |= flags::COMPRESSED;
        }
        let mut annotations = self.reply_annotations(correlation);
        annotations.extend(extra_annotations);
        let reply = Message::new(
            MsgType::Result,
            reply_flags,
            seq,
            serializer.serializer_id(),
            payload,
            annotations,
        );
        if self.config.logwire {
            log_wiredata("daemon wiredata sending (error response)", &reply);
        }
        conn.send_bytes(&reply.to_bytes().location(loc!())?)
    }
}

fn str_arg<'a>(vargs: &'a Args, index: usize) -> Result<&'a str> {
    vargs.get(index).and_then(Value::as_str).ok_or_else(|| {
        anyhow!(PyroError::Type("attribute name must be a string".into()))
    })
}

// Method resolution goes through the exposed-member set, never the raw
// table: unexposed and private names fail identically to unknown ones.
fn resolve_method<'a>(
    class: &'a std::sync::Arc<ExposedClass>,
    name: &str,
) -> Result<&'a crate::expose::MethodDef> {
    let members = reflect::get_exposed_members(class, true, false, true);
    if !members.methods.contains(name) {
        bail!(PyroError::Attribute(format!(
            "remote object has no exposed method or attribute '{name}'"
        )));
    }
    class
        .method(name)
        .ok_or_else(|| anyhow!(PyroError::Daemon(format!("method table lost '{name}'"))))
}

fn parse_batch_item(item: &Value) -> Result<(String, Args, Kwargs)> {
    let invalid = || PyroError::Protocol("invalid batch item".into());
    let parts = item.as_array().ok_or_else(invalid)?;
    let [name, vargs, kwargs] = parts.as_slice() else {
        bail!(invalid());
    };
    let name = name.as_str().ok_or_else(invalid)?;
    if name == "__batch__" {
        bail!(PyroError::Protocol("nested batch calls are not supported".into()));
    }
    Ok((
        name.to_owned(),
        vargs.as_array().ok_or_else(invalid)?.clone(),
        kwargs.as_object().ok_or_else(invalid)?.clone(),
    ))
}
