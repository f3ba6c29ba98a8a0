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

use std::fmt;
use std::str::FromStr;

use crate::prelude::*;

/// A printable reference to one object inside one daemon:
/// `PYRO:<object-id>@<location>`. The location is `host:port` for TCP
/// daemons and `./u:<path>` for unix-socket daemons.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PyroUri {
    pub object_id: String,
    pub location: String,
}

impl PyroUri {
    pub fn new(object_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for PyroUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PYRO:{}@{}", self.object_id, self.location)
    }
}

impl FromStr for PyroUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("PYRO:")
            .ok_or_else(|| anyhow!(PyroError::Protocol(format!("invalid uri scheme: {s}"))))?;
        let (object_id, location) = rest
            .split_once('@')
            .ok_or_else(|| anyhow!(PyroError::Protocol(format!("invalid uri: {s}"))))?;
        if object_id.is_empty() || location.is_empty() {
            bail!(PyroError::Protocol(format!("invalid uri: {s}")));
        }
        Ok(Self::new(object_id, location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let uri = PyroUri::new("obj_1234", "localhost:9090");
        let parsed: PyroUri = uri.to_string().parse().unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn parse_accepts_unix_socket_locations() {
        let uri: PyroUri = "PYRO:Pyro.Daemon@./u:/tmp/pyrod.sock".parse().unwrap();
        assert_eq!(uri.object_id, "Pyro.Daemon");
        assert_eq!(uri.location, "./u:/tmp/pyrod.sock");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("HTTP:foo@bar".parse::<PyroUri>().is_err());
        assert!("PYRO:missing-location".parse::<PyroUri>().is_err());
        assert!("PYRO:@nohost".parse::<PyroUri>().is_err());
        assert!("PYRO:noid@".parse::<PyroUri>().is_err());
    }
}
