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
use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::panic;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use nix::sys::stat;
use nix::sys::stat::Mode;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;

use crate::prelude::*;

/// How the daemon binary logs: always to stderr, optionally to a file as
/// well. Assembled from the CLI flags in `bin/pyrod.rs`.
pub struct LogOptions {
    pub stderr_level: Level,
    pub log_file: Option<PathBuf>,
    pub file_level: Level,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stderr_level: Level::INFO,
            log_file: None,
            file_level: Level::TRACE,
        }
    }
}

/// Install the global subscriber: a terse stderr layer, plus an ansi-free
/// file layer carrying source locations and thread ids when a log file is
/// configured.
pub fn init_logging(options: LogOptions) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr.with_max_level(options.stderr_level));
    match options.log_file {
        Some(path) => {
            let file = File::create(&path)
                .with_context(loc!(), || format!("unable to create log file {path:?}"))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file).with_max_level(options.file_level));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        },
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        },
    }
    Ok(())
}

/// A daemon thread that dies should take the process with it rather than
/// leave a half-functional server behind.
pub fn exit_on_thread_panic() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        error!("thread '{name}' panicked:\n{info}\n{}", Backtrace::capture());
        default_hook(info);
        process::exit(1);
    }));
}

/// Bind a unix socket reachable only by the owning user. A stale socket
/// left behind by a previous run is replaced; any other kind of file at the
/// path is refused.
pub fn bind_private_socket(path: &Path) -> Result<UnixListener> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).location(loc!())?;
        },
        Ok(_) => bail!(PyroError::Daemon(format!(
            "refusing to replace non-socket file {path:?}"
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {},
        Err(err) => {
            return Err(err).with_context(loc!(), || format!("cannot stat {path:?}"));
        },
    }

    // Group/other bits masked off for the duration of the bind.
    let previous = stat::umask(Mode::from_bits_truncate(0o077));
    let bound = UnixListener::bind(path);
    stat::umask(previous);
    bound.with_context(loc!(), || format!("unable to bind unix socket {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_private_socket_replaces_only_stale_sockets() {
        let dir = std::env::temp_dir().join(format!("pyrod-utils-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let path = dir.join("stale.sock");
        let first = bind_private_socket(&path).unwrap();
        drop(first);
        // The socket file is still on disk; binding again must succeed.
        assert!(path.exists());
        let _second = bind_private_socket(&path).unwrap();

        // A regular file at the path is never clobbered.
        let plain = dir.join("not-a-socket");
        fs::write(&plain, b"data").unwrap();
        let err = bind_private_socket(&plain).unwrap_err();
        assert!(err.to_string().contains("refusing to replace"));
        assert_eq!(fs::read(&plain).unwrap(), b"data");

        fs::remove_dir_all(&dir).unwrap();
    }
}
