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

use std::env;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ron::Options;
use ron::extensions::Extensions;
use serde::Deserialize;
use serde::Serialize;
use tracing::Level;
use tracing::metadata::ParseLevelError;

use crate::prelude::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq, serde_derive::Deserialize, serde_derive::Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// One worker thread per accepted connection.
    Thread,
    /// A single event-loop thread servicing all sockets.
    Multiplex,
}

/// Everything the daemon consumes from configuration. Loaded from a RON
/// file and overridden by CLI flags in the binary; library users fill it in
/// directly.
#[derive(Debug, Clone, PartialEq, serde_derive::Deserialize, serde_derive::Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Serve on a unix domain socket instead of TCP. Conflicts with NAT.
    pub unixsocket: Option<PathBuf>,
    pub nathost: Option<String>,
    /// Required together with `nathost`; 0 re-uses the bound port.
    pub natport: Option<u16>,
    pub servertype: ServerType,
    pub serializers_accepted: Vec<String>,
    pub compression: bool,
    pub oneway_threaded: bool,
    pub iter_streaming: bool,
    /// Seconds a stream may live in total; 0 disables the limit.
    pub iter_stream_lifetime: f64,
    /// Seconds a stream survives its client's disconnect; 0 disables.
    pub iter_stream_linger: f64,
    pub autoproxy: bool,
    pub detailed_traceback: bool,
    pub logwire: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 0,
            unixsocket: None,
            nathost: None,
            natport: None,
            servertype: ServerType::Thread,
            serializers_accepted: vec!["json".to_owned(), "msgpack".to_owned()],
            compression: false,
            oneway_threaded: true,
            iter_streaming: true,
            iter_stream_lifetime: 0.0,
            iter_stream_linger: 30.0,
            autoproxy: true,
            detailed_traceback: false,
            logwire: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.nathost.is_some() != self.natport.is_some() {
            bail!(PyroError::Daemon("must provide natport with nathost".into()));
        }
        if self.nathost.is_some() && self.unixsocket.is_some() {
            bail!(PyroError::Daemon(
                "cannot use nathost together with unixsocket".into()
            ));
        }
        if self.serializers_accepted.is_empty() {
            bail!(PyroError::Daemon("no serializers accepted".into()));
        }
        if self.iter_stream_lifetime < 0.0 || self.iter_stream_linger < 0.0 {
            bail!(PyroError::Daemon("stream timings must not be negative".into()));
        }
        Ok(())
    }

    pub fn stream_lifetime(&self) -> Duration {
        Duration::from_secs_f64(self.iter_stream_lifetime)
    }

    pub fn stream_linger(&self) -> Duration {
        Duration::from_secs_f64(self.iter_stream_linger)
    }
}

fn fallback_config_parent_dir() -> Result<PathBuf> {
    Ok(Path::join(
        &home::home_dir().ok_or(anyhow!("unable to determine home dir"))?,
        ".config",
    ))
}

pub fn default_config_file_dir() -> PathBuf {
    Path::join(
        &env::var("XDG_CONFIG_HOME")
            .map(Into::into)
            .ok()
            .or(fallback_config_parent_dir().ok())
            .unwrap_or_else(|| "/etc".into()),
        "pyrod",
    )
}

pub fn default_config_file() -> PathBuf {
    Path::join(&default_config_file_dir(), "pyrod.ron")
}

pub fn maybe_read_ron_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        debug!("config file does not exist at {path:?}");
        return Ok(None);
    }

    let config_str = std::fs::read_to_string(path)
        .with_context(loc!(), || format!("unable to read config file {path:?}"))?;
    let config: T = Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .from_str(&config_str)
        .with_context(loc!(), || format!("error parsing config file {path:?}"))?;
    Ok(Some(config))
}

pub fn print_default_config_and_exit() -> ! {
    println!(
        "{}",
        ron::ser::to_string_pretty::<Config>(&Default::default(), ron::ser::PrettyConfig::default())
            .expect("default config must be serializable")
    );
    std::process::exit(0);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerializableLevel(pub Level);

impl FromStr for SerializableLevel {
    type Err = ParseLevelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Level::from_str(s)?))
    }
}

impl Serialize for SerializableLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for SerializableLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self(Level::from_str(&s).map_err(serde::de::Error::custom)?))
    }
}
