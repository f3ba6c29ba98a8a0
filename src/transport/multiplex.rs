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

use std::io;
use std::sync::Arc;
use std::time::Duration;

use calloop::EventLoop;
use calloop::Interest;
use calloop::LoopHandle;
use calloop::LoopSignal;
use calloop::Mode;
use calloop::PostAction;
use calloop::generic::Generic;
use calloop::timer::TimeoutAction;
use calloop::timer::Timer;

use crate::connection::ClientConnection;
use crate::connection::Transport;
use crate::errors;
use crate::prelude::*;
use crate::server::Daemon;
use crate::transport::Listener;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(200);

struct LoopState {
    daemon: Arc<Daemon>,
    handle: LoopHandle<'static, LoopState>,
    signal: LoopSignal,
}

/// Multiplexed substrate: one thread, one event loop, every socket a
/// readiness source. Handshakes run in the accept callback; requests are
/// dispatched one at a time as their sockets become readable.
pub(crate) fn run(daemon: &Arc<Daemon>, listener: Listener) -> Result<()> {
    listener.set_nonblocking(true).location(loc!())?;
    let mut event_loop = EventLoop::<'static, LoopState>::try_new().location(loc!())?;
    let handle = event_loop.handle();
    let signal = event_loop.get_signal();

    handle
        .insert_source(
            Generic::new(listener, Interest::READ, Mode::Level),
            |_, listener, state: &mut LoopState| {
                match listener.accept() {
                    Ok(transport) => accept_client(state, transport),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {},
                    Err(err) => error!("error accepting connection: {err}"),
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| anyhow!("failed to watch listening socket: {err}"))?;

    handle
        .insert_source(
            Timer::from_duration(HOUSEKEEPING_INTERVAL),
            |_, _, state: &mut LoopState| {
                if state.daemon.is_shutting_down() {
                    state.signal.stop();
                    return TimeoutAction::Drop;
                }
                state.daemon.housekeeping();
                TimeoutAction::ToDuration(HOUSEKEEPING_INTERVAL)
            },
        )
        .map_err(|err| anyhow!("failed to schedule housekeeping: {err}"))?;

    let mut state = LoopState {
        daemon: Arc::clone(daemon),
        handle,
        signal,
    };
    event_loop
        .run(DISPATCH_TIMEOUT, &mut state, |state| {
            if state.daemon.is_shutting_down() {
                state.signal.stop();
            }
        })
        .location(loc!())?;
    Ok(())
}

fn accept_client(state: &mut LoopState, transport: Box<dyn Transport>) {
    let mut conn = ClientConnection::new(transport, Arc::clone(&state.daemon.must_shutdown));
    debug!("connection from {}", conn.peer());
    match state.daemon.handshake(&mut conn) {
        Ok(true) => {},
        Ok(false) => {
            state.daemon.client_disconnect(&mut conn);
            return;
        },
        Err(err) => {
            debug!("handshake with {} failed: {err:?}", conn.peer());
            state.daemon.client_disconnect(&mut conn);
            return;
        },
    }

    let poll_fd = match conn.poll_fd() {
        Ok(fd) => fd,
        Err(err) => {
            error!("cannot poll connection from {}: {err}", conn.peer());
            state.daemon.client_disconnect(&mut conn);
            return;
        },
    };
    let inserted = state.handle.insert_source(
        Generic::new(poll_fd, Interest::READ, Mode::Level),
        move |_, _, state: &mut LoopState| match state.daemon.handle_request(&mut conn) {
            Ok(()) => Ok(PostAction::Continue),
            Err(err) => {
                if !errors::is_connection_closed(&err) {
                    debug!("closing connection {} after error: {err:?}", conn.peer());
                }
                state.daemon.client_disconnect(&mut conn);
                Ok(PostAction::Remove)
            },
        },
    );
    if let Err(err) = inserted {
        error!("failed to watch client socket: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::thread;

    use serde_json::Value;
    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::config::ServerType;
    use crate::expose::ExposedClass;
    use crate::protocol::Annotations;
    use crate::protocol::Message;
    use crate::protocol::MsgType;

    struct Adder;

    #[test]
    fn serves_clients_from_a_single_event_loop() {
        let config = Config {
            host: "127.0.0.1".to_owned(),
            servertype: ServerType::Multiplex,
            ..Config::default()
        };
        let daemon = Daemon::new(config).unwrap();
        let class = ExposedClass::builder::<Adder>("Adder")
            .constructor(|| Adder)
            .method("add", |_, vargs, _| {
                let a = vargs[0].as_i64().unwrap_or(0);
                let b = vargs[1].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .build()
            .unwrap();
        daemon.register(class, Some("adder"), false).unwrap();

        let loop_daemon = Arc::clone(&daemon);
        let server = thread::spawn(move || loop_daemon.request_loop());

        let mut stream = TcpStream::connect(daemon.location()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        use std::io::Write;

        let connect_payload =
            serde_json::to_vec(&json!({"handshake": "hi", "object": "adder"})).unwrap();
        let frame = Message::new(MsgType::Connect, 0, 1, 2, connect_payload, Annotations::new())
            .to_bytes()
            .unwrap();
        stream.write_all(&frame).unwrap();
        let ok = Message::recv(&mut stream, &[MsgType::ConnectOk, MsgType::ConnectFail]).unwrap();
        assert_eq!(ok.msg_type, MsgType::ConnectOk);

        for (seq, (a, b)) in [(2u32, (1i64, 2i64)), (3, (40, 2))] {
            let payload = serde_json::to_vec(&json!(["adder", "add", [a, b], {}])).unwrap();
            let frame = Message::new(MsgType::Invoke, 0, seq, 2, payload, Annotations::new())
                .to_bytes()
                .unwrap();
            stream.write_all(&frame).unwrap();
            let reply = Message::recv(&mut stream, &[MsgType::Result]).unwrap();
            assert_eq!(reply.seq, seq);
            let value: Value = serde_json::from_slice(&reply.payload).unwrap();
            assert_eq!(value, json!(a + b));
        }

        daemon.shutdown();
        server.join().unwrap().unwrap();
    }
}
