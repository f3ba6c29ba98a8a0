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
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixListener;

use crate::config::Config;
use crate::connection::Transport;
use crate::prelude::*;

pub mod multiplex;
pub mod threaded;

/// The daemon's listening socket, TCP or unix domain.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn accept(&self) -> io::Result<Box<dyn Transport>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            },
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok(Box::new(stream))
            },
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Listener::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}

/// Bind per configuration and return the listener together with the
/// daemon's location string (`host:port`, or `./u:<path>` for unix
/// sockets).
pub(crate) fn bind(config: &Config) -> Result<(Listener, String)> {
    if let Some(path) = &config.unixsocket {
        let listener = crate::utils::bind_private_socket(path).location(loc!())?;
        let location = format!("./u:{}", path.display());
        Ok((Listener::Unix(listener), location))
    } else {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .with_context(loc!(), || {
                format!("unable to bind on {}:{}", config.host, config.port)
            })?;
        let port = listener.local_addr().location(loc!())?.port();
        Ok((Listener::Tcp(listener), format!("{}:{port}", config.host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_bind_reports_the_ephemeral_port() {
        let config = Config {
            host: "127.0.0.1".to_owned(),
            ..Config::default()
        };
        let (listener, location) = bind(&config).unwrap();
        let port: u16 = location.rsplit_once(':').unwrap().1.parse().unwrap();
        assert!(port > 0);
        assert!(matches!(listener, Listener::Tcp(_)));
    }

    #[test]
    fn unix_bind_uses_the_socket_path_location() {
        let dir = std::env::temp_dir().join(format!("pyrod-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("daemon.sock");
        let config = Config {
            unixsocket: Some(path.clone()),
            ..Config::default()
        };
        let (listener, location) = bind(&config).unwrap();
        assert!(matches!(listener, Listener::Unix(_)));
        assert_eq!(location, format!("./u:{}", path.display()));
        drop(listener);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
