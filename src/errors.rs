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

use std::backtrace::Backtrace;
use std::fmt;
use std::fmt::Display;

use anyhow::Result;
use serde_json::Value;
use serde_json::json;
use tracing::error;
use tracing::warn;

/// A source position attached to error context, so a propagated failure
/// names the call sites it crossed.
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[macro_export]
macro_rules! loc {
    () => {
        $crate::errors::Location {
            file: file!(),
            line: line!(),
        }
    };
}
pub use loc;

/// The one context-attachment surface this crate uses on fallible
/// expressions: `.location(loc!())` to record the call site,
/// `.context(loc!(), ..)` to add a message with it, and the `logged`/
/// `ignored` forms for places that report instead of propagating.
pub trait ErrorContext<T, E>: anyhow::Context<T, E> + Sized {
    fn location(self, loc: Location) -> Result<T> {
        anyhow::Context::with_context(self, || loc)
    }

    fn context<C>(self, loc: Location, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::with_context(self, || format!("{loc}: {context}"))
    }

    fn with_context<C, F>(self, loc: Location, context: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, || format!("{loc}: {}", context()))
    }

    /// Log a failure at error level, then pass the result on unchanged.
    fn logged(self, loc: Location) -> Result<T> {
        let result = self.location(loc);
        if let Err(err) = &result {
            error!("{err:?}");
        }
        result
    }

    /// Log a failure at warn level and swallow it, for spots where an error
    /// must not interrupt the caller.
    fn ignored(self, loc: Location) {
        if let Err(err) = self.location(loc) {
            warn!("{err:?}");
        }
    }
}

impl<R, T, E> ErrorContext<T, E> for R where R: anyhow::Context<T, E> {}

/// The error kinds a daemon distinguishes when deciding how to reply, whether
/// to tear down a connection, and what type tag to put on a serialized
/// exception.
///
/// `ConnectionClosed` counts as a communication error (it is the subtype used
/// for orderly or abrupt peer disconnects). `Generic` is the catch-all base
/// kind.
#[derive(Debug, thiserror::Error)]
pub enum PyroError {
    #[error("communication error: {0}")]
    Communication(String),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("security error: {0}")]
    Security(String),
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("attribute error: {0}")]
    Attribute(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("stream exhausted")]
    StreamExhausted,
    #[error("{0}")]
    Generic(String),
}

impl PyroError {
    /// The exception type name used on the wire, matching what PYRO-protocol
    /// clients expect to see.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            PyroError::Communication(_) => "CommunicationError",
            PyroError::ConnectionClosed(_) => "ConnectionClosedError",
            PyroError::Protocol(_) => "ProtocolError",
            PyroError::Serialization(_) => "SerializationError",
            PyroError::Security(_) => "SecurityError",
            PyroError::Daemon(_) => "DaemonError",
            PyroError::Attribute(_) => "AttributeError",
            PyroError::Type(_) => "TypeError",
            PyroError::StreamExhausted => "StopIteration",
            PyroError::Generic(_) => "PyroError",
        }
    }

    /// The bare message, without the kind prefix Display adds.
    pub fn message(&self) -> String {
        match self {
            PyroError::Communication(msg)
            | PyroError::ConnectionClosed(msg)
            | PyroError::Protocol(msg)
            | PyroError::Serialization(msg)
            | PyroError::Security(msg)
            | PyroError::Daemon(msg)
            | PyroError::Attribute(msg)
            | PyroError::Type(msg)
            | PyroError::Generic(msg) => msg.clone(),
            PyroError::StreamExhausted => self.to_string(),
        }
    }
}

fn root_kind(err: &anyhow::Error) -> Option<&PyroError> {
    err.downcast_ref::<PyroError>()
}

pub fn wire_kind(err: &anyhow::Error) -> &'static str {
    root_kind(err).map_or("PyroError", PyroError::wire_kind)
}

/// The message of the underlying error, without any context wrapping that
/// was layered on during propagation.
pub fn root_message(err: &anyhow::Error) -> String {
    root_kind(err).map_or_else(|| err.root_cause().to_string(), PyroError::message)
}

pub fn is_connection_closed(err: &anyhow::Error) -> bool {
    matches!(root_kind(err), Some(PyroError::ConnectionClosed(_)))
}

pub fn is_communication_error(err: &anyhow::Error) -> bool {
    matches!(
        root_kind(err),
        Some(PyroError::Communication(_) | PyroError::ConnectionClosed(_))
    )
}

pub fn is_security_error(err: &anyhow::Error) -> bool {
    matches!(root_kind(err), Some(PyroError::Security(_)))
}

pub fn is_serialization_error(err: &anyhow::Error) -> bool {
    matches!(root_kind(err), Some(PyroError::Serialization(_)))
}

// Non-detailed tracebacks are capped so a reply never balloons just because
// an error chain did.
const TRACEBACK_SIZE_LIMIT: usize = 2000;

/// Render the error chain the way the reply payload carries it. The detailed
/// form includes every cause plus a captured backtrace; the terse form is a
/// single size-limited line per cause.
pub fn format_traceback(err: &anyhow::Error, detailed: bool) -> Vec<String> {
    let mut lines: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
    if detailed {
        let backtrace = Backtrace::force_capture().to_string();
        lines.extend(backtrace.lines().map(str::to_owned));
    } else {
        let mut remaining = TRACEBACK_SIZE_LIMIT;
        lines.retain_mut(|line| {
            if remaining == 0 {
                return false;
            }
            if line.len() > remaining {
                let mut cut = remaining;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                line.truncate(cut);
            }
            remaining -= line.len();
            true
        });
    }
    lines
}

/// The serialized form of a failed call: what goes into a RESULT payload with
/// the EXCEPTION flag set, and into the wrapper entries of a batch reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    pub exc_type: String,
    pub msg: String,
    pub traceback: Vec<String>,
}

impl RemoteException {
    pub fn from_error(err: &anyhow::Error, detailed_traceback: bool) -> Self {
        Self {
            exc_type: wire_kind(err).to_owned(),
            msg: root_kind(err).map_or_else(|| err.to_string(), PyroError::message),
            traceback: format_traceback(err, detailed_traceback),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "__class__": self.exc_type,
            "__exception__": true,
            "args": [self.msg],
            "attributes": {"_pyroTraceback": self.traceback},
        })
    }

    /// Parse the wire form back. Only the daemon's own tests and batch
    /// wrapper inspection need this direction.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.get("__exception__").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let exc_type = value.get("__class__")?.as_str()?.to_owned();
        let msg = value
            .get("args")
            .and_then(Value::as_array)
            .and_then(|args| args.first())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let traceback = value
            .get("attributes")
            .and_then(|attrs| attrs.get("_pyroTraceback"))
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            exc_type,
            msg,
            traceback,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn wire_kind_reads_the_chain_root() {
        let err = anyhow::Error::new(PyroError::Daemon("unknown object".into()))
            .context("while dispatching");
        assert_eq!(wire_kind(&err), "DaemonError");
        assert!(!is_communication_error(&err));
    }

    #[test]
    fn connection_closed_is_a_communication_error() {
        let err = anyhow::Error::new(PyroError::ConnectionClosed("eof".into()));
        assert!(is_connection_closed(&err));
        assert!(is_communication_error(&err));

        let err = anyhow::Error::new(PyroError::Communication("reset".into()));
        assert!(!is_connection_closed(&err));
        assert!(is_communication_error(&err));
    }

    #[test]
    fn plain_errors_map_to_the_generic_kind() {
        let err = anyhow!("something else entirely");
        assert_eq!(wire_kind(&err), "PyroError");
    }

    #[test]
    fn remote_exception_round_trips_through_the_wire_form() {
        let err = anyhow::Error::new(PyroError::Protocol("bad frame".into()));
        let exc = RemoteException::from_error(&err, false);
        let value = exc.to_value();
        assert_eq!(value["__class__"], "ProtocolError");
        assert_eq!(value["__exception__"], true);
        assert_eq!(RemoteException::from_value(&value).unwrap(), exc);
    }

    #[test]
    fn terse_traceback_is_size_limited() {
        let err = anyhow!("x".repeat(10_000));
        let lines = format_traceback(&err, false);
        let total: usize = lines.iter().map(String::len).sum();
        assert!(total <= TRACEBACK_SIZE_LIMIT);
    }

    #[test]
    fn detailed_traceback_contains_every_cause() {
        let err = anyhow::Error::new(PyroError::Daemon("inner".into())).context("outer");
        let lines = format_traceback(&err, true);
        assert!(lines.iter().any(|l| l.contains("outer")));
        assert!(lines.iter().any(|l| l.contains("inner")));
    }
}
