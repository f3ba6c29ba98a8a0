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

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use serde_json::Value;
use serde_json::json;

use pyrod::config;
use pyrod::config::Config;
use pyrod::config::SerializableLevel;
use pyrod::config::ServerType;
use pyrod::expose::ExposedClass;
use pyrod::expose::ItemStream;
use pyrod::prelude::*;
use pyrod::server::Daemon;
use pyrod::utils;

/// RPC daemon speaking the PYRO object protocol, serving a small demo
/// object. Settings come from a RON config file overridden by these flags.
#[derive(Parser, Debug)]
#[command(name = "pyrod", version)]
struct Cli {
    /// Print a config file with default values to stdout and exit.
    #[arg(long)]
    print_default_config: bool,
    /// Path to the RON config file.
    #[arg(long)]
    config_file: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Serve on a unix domain socket instead of TCP.
    #[arg(long)]
    unixsocket: Option<PathBuf>,
    #[arg(long)]
    nathost: Option<String>,
    #[arg(long)]
    natport: Option<u16>,
    #[arg(long, value_enum)]
    servertype: Option<ServerType>,
    #[arg(long)]
    compression: Option<bool>,
    #[arg(long)]
    logwire: Option<bool>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    stderr_log_level: SerializableLevel,
    #[arg(long, default_value = "trace")]
    file_log_level: SerializableLevel,
}

struct Demo {
    started: Instant,
}

fn demo_class() -> Result<std::sync::Arc<ExposedClass>> {
    ExposedClass::builder::<Demo>("Demo")
        .constructor(|| Demo {
            started: Instant::now(),
        })
        .method("echo", |_, vargs, _| {
            Ok(vargs.into_iter().next().unwrap_or(Value::Null))
        })
        .method("uptime", |obj: &Demo, _, _| {
            Ok(json!(obj.started.elapsed().as_secs_f64()))
        })
        .stream_method("count_to", |_, vargs, _| {
            let n = vargs.first().and_then(Value::as_i64).unwrap_or(10);
            let stream: ItemStream = Box::new((0..n).map(|i| Ok(json!(i))));
            Ok(stream)
        })
        .build()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.print_default_config {
        config::print_default_config_and_exit();
    }

    let config_file = cli
        .config_file
        .clone()
        .unwrap_or_else(config::default_config_file);
    let mut config: Config = config::maybe_read_ron_file(&config_file)
        .location(loc!())?
        .unwrap_or_default();

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.unixsocket.is_some() {
        config.unixsocket = cli.unixsocket;
    }
    if cli.nathost.is_some() {
        config.nathost = cli.nathost;
    }
    if cli.natport.is_some() {
        config.natport = cli.natport;
    }
    if let Some(servertype) = cli.servertype {
        config.servertype = servertype;
    }
    if let Some(compression) = cli.compression {
        config.compression = compression;
    }
    if let Some(logwire) = cli.logwire {
        config.logwire = logwire;
    }

    utils::init_logging(utils::LogOptions {
        stderr_level: cli.stderr_log_level.0,
        log_file: cli.log_file,
        file_level: cli.file_log_level.0,
    })
    .location(loc!())?;
    utils::exit_on_thread_panic();

    let daemon = Daemon::new(config).location(loc!())?;
    let uri = daemon
        .register(demo_class().location(loc!())?, Some("demo"), false)
        .location(loc!())?;
    info!("{}", daemon.info());
    println!("demo object uri: {uri}");

    // Serves until the process is terminated.
    daemon.request_loop().location(loc!())?;
    Ok(())
}
