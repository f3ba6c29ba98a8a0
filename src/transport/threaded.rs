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
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::connection::ClientConnection;
use crate::errors;
use crate::prelude::*;
use crate::server::Daemon;
use crate::transport::Listener;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);

/// Thread-per-connection substrate: the calling thread polls the listener,
/// every accepted connection gets its own worker, and a housekeeper thread
/// sweeps periodically. Returns when the daemon starts shutting down.
pub(crate) fn run(daemon: &Arc<Daemon>, listener: Listener) -> Result<()> {
    listener.set_nonblocking(true).location(loc!())?;
    let housekeeper = spawn_housekeeper(daemon);

    while !daemon.is_shutting_down() {
        match listener.accept() {
            Ok(transport) => {
                let daemon = Arc::clone(daemon);
                let conn = ClientConnection::new(transport, Arc::clone(&daemon.must_shutdown));
                thread::Builder::new()
                    .name(format!("client-{}", conn.id().0))
                    .spawn(move || serve_client(&daemon, conn))
                    .map(|_handle| ())
                    .ignored(loc!());
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            },
            Err(err) => {
                error!("error accepting connection: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            },
        }
    }

    // Worker threads notice the flag through their receive timeouts and
    // drain on their own; only the housekeeper is joined here.
    housekeeper.join().ok();
    Ok(())
}

fn serve_client(daemon: &Arc<Daemon>, mut conn: ClientConnection) {
    debug!("connection from {}", conn.peer());
    match daemon.handshake(&mut conn) {
        Ok(true) => loop {
            if let Err(err) = daemon.handle_request(&mut conn) {
                if !errors::is_connection_closed(&err) {
                    debug!("closing connection {} after error: {err:?}", conn.peer());
                }
                break;
            }
        },
        Ok(false) => {},
        Err(err) => debug!("handshake with {} failed: {err:?}", conn.peer()),
    }
    daemon.client_disconnect(&mut conn);
    debug!("disconnected {}", conn.peer());
}

fn spawn_housekeeper(daemon: &Arc<Daemon>) -> thread::JoinHandle<()> {
    let daemon = Arc::clone(daemon);
    thread::Builder::new()
        .name("housekeeper".to_owned())
        .spawn(move || {
            let mut last_sweep = Instant::now();
            while !daemon.is_shutting_down() {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                if last_sweep.elapsed() >= HOUSEKEEPING_INTERVAL {
                    daemon.housekeeping();
                    last_sweep = Instant::now();
                }
            }
        })
        .expect("error starting housekeeper thread")
}
