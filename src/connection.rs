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
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use crate::expose::ServedInstance;
use crate::prelude::*;
use crate::protocol::Message;
use crate::protocol::MsgType;

// How often a blocked receive re-checks the shutdown flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Identifies one client connection for the daemon's lifetime. Stream
/// entries and request contexts refer to connections by this id, never by
/// reference, so they stay valid after the socket goes away.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnId(pub u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The byte-stream capability a connection runs over. Real daemons use TCP
/// or unix sockets; tests substitute an in-memory pipe.
pub trait Transport: Read + Write + Send {
    fn peer(&self) -> String;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// A dupped fd the multiplexed server can poll on.
    fn poll_fd(&self) -> io::Result<OwnedFd>;
}

impl Transport for TcpStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn poll_fd(&self) -> io::Result<OwnedFd> {
        Ok(self.try_clone()?.into())
    }
}

impl Transport for UnixStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| format!("{addr:?}"))
            .unwrap_or_else(|_| "unknown".to_owned())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn poll_fd(&self) -> io::Result<OwnedFd> {
        Ok(self.try_clone()?.into())
    }
}

// Turns the transport's receive timeouts into shutdown checks, so a frame
// read blocks indefinitely for data but still notices a stopping daemon.
// Partial reads accumulate in the caller's read_exact loop.
struct AbortableReader<'a> {
    inner: &'a mut dyn Transport,
    abort: &'a AtomicBool,
}

impl Read for AbortableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if self.abort.load(Ordering::Acquire) {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "daemon shutting down",
                        ));
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                other => return other,
            }
        }
    }
}

/// One client socket plus its confined per-session state: the session
/// instance bag and the correlation id of the last request, which reply
/// annotations echo.
pub struct ClientConnection {
    transport: Box<dyn Transport>,
    id: ConnId,
    peer: String,
    shutdown: Arc<AtomicBool>,
    session_instances: HashMap<usize, ServedInstance>,
    pub(crate) correlation_id: Option<Uuid>,
}

impl ClientConnection {
    pub fn new(transport: Box<dyn Transport>, shutdown: Arc<AtomicBool>) -> Self {
        transport
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .ignored(loc!());
        let peer = transport.peer();
        Self {
            transport,
            id: ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)),
            peer,
            shutdown,
            session_instances: HashMap::new(),
            correlation_id: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// A dupped fd for readiness polling by the multiplexed server.
    pub fn poll_fd(&self) -> io::Result<OwnedFd> {
        self.transport.poll_fd()
    }

    pub fn recv_message(&mut self, expected: &[MsgType]) -> Result<Message> {
        let mut reader = AbortableReader {
            inner: &mut *self.transport,
            abort: &*self.shutdown,
        };
        Message::recv(&mut reader, expected)
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let map_err = |err: io::Error| -> anyhow::Error {
            match err.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted => {
                    PyroError::ConnectionClosed(format!("connection lost while sending: {err}"))
                        .into()
                },
                _ => PyroError::Communication(format!("error sending frame: {err}")).into(),
            }
        };
        self.transport.write_all(bytes).map_err(map_err)?;
        self.transport.flush().map_err(map_err)
    }

    pub(crate) fn session_instance(&self, class_key: usize) -> Option<ServedInstance> {
        self.session_instances.get(&class_key).cloned()
    }

    pub(crate) fn store_session_instance(&mut self, class_key: usize, instance: ServedInstance) {
        self.session_instances.insert(class_key, instance);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::scripted_connection;
    use super::*;
    use crate::protocol::Annotations;

    #[test]
    fn connection_ids_are_unique() {
        let (a, _) = scripted_connection(Vec::new());
        let (b, _) = scripted_connection(Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn messages_round_trip_through_a_connection() {
        let request = Message::new(
            MsgType::Ping,
            0,
            9,
            2,
            b"ping".to_vec(),
            Annotations::new(),
        );
        let (mut conn, output) = scripted_connection(request.to_bytes().unwrap());

        let received = conn.recv_message(&[MsgType::Ping]).unwrap();
        assert_eq!(received.seq, 9);

        let reply = Message::new(MsgType::Ping, 0, 9, 2, b"pong".to_vec(), Annotations::new());
        conn.send_bytes(&reply.to_bytes().unwrap()).unwrap();

        let bytes = output.lock().unwrap().clone();
        let parsed = Message::recv(&mut std::io::Cursor::new(bytes), &[MsgType::Ping]).unwrap();
        assert_eq!(parsed.payload, b"pong");
    }

    #[test]
    fn exhausted_input_reports_connection_closed() {
        let (mut conn, _) = scripted_connection(Vec::new());
        let err = conn.recv_message(&[MsgType::Invoke]).unwrap_err();
        assert!(crate::errors::is_connection_closed(&err));
    }

    #[test]
    fn session_bag_stores_one_instance_per_class_key() {
        let (mut conn, _) = scripted_connection(Vec::new());
        let instance: ServedInstance = Arc::new(5i64);
        assert!(conn.session_instance(7).is_none());
        conn.store_session_instance(7, Arc::clone(&instance));
        assert!(conn.session_instance(7).is_some());
        assert!(conn.session_instance(8).is_none());
    }
}
