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

use std::sync::Arc;
use std::sync::Weak;

use serde_json::Value;
use serde_json::json;

use crate::expose::Args;
use crate::expose::ExposedClass;
use crate::expose::Kwargs;
use crate::prelude::*;
use crate::server::Daemon;

/// The daemon's embedded introspection object, registered under the
/// reserved well-known id. Holds the daemon by handle, not ownership.
pub struct DaemonObject {
    pub(crate) daemon: Weak<Daemon>,
}

impl DaemonObject {
    fn daemon(&self) -> Result<Arc<Daemon>> {
        self.daemon
            .upgrade()
            .ok_or_else(|| anyhow!(PyroError::Daemon("daemon is gone".into())))
    }
}

fn str_arg<'a>(vargs: &'a Args, index: usize, name: &str) -> Result<&'a str> {
    vargs
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!(PyroError::Type(format!("{name} must be a string"))))
}

fn bool_arg(vargs: &Args, index: usize, kwargs: &Kwargs, name: &str) -> bool {
    vargs
        .get(index)
        .or_else(|| kwargs.get(name))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Descriptor table of the introspection object, built with the same
/// builder every served class uses.
pub(crate) fn daemon_object_class() -> Result<Arc<ExposedClass>> {
    ExposedClass::builder::<DaemonObject>("DaemonObject")
        .method("registered", |obj: &DaemonObject, _, _| {
            Ok(json!(obj.daemon()?.registered()))
        })
        .method("ping", |_, _, _| Ok(Value::Null))
        .method("info", |obj: &DaemonObject, _, _| Ok(json!(obj.daemon()?.info())))
        .method("get_metadata", |obj: &DaemonObject, vargs, kwargs| {
            let object_id = str_arg(&vargs, 0, "objectId").location(loc!())?;
            let as_lists = bool_arg(&vargs, 1, &kwargs, "as_lists");
            Ok(obj.daemon()?.get_metadata(object_id, as_lists)?.to_value())
        })
        .method_with_context("get_next_stream_item", |obj: &DaemonObject, ctx, vargs, _| {
            let stream_id = str_arg(&vargs, 0, "streamId").location(loc!())?;
            obj.daemon()?.streams.next_item(stream_id, ctx.client)
        })
        .method("close_stream", |obj: &DaemonObject, vargs, _| {
            let stream_id = str_arg(&vargs, 0, "streamId").location(loc!())?;
            obj.daemon()?.streams.close(stream_id);
            Ok(Value::Null)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reflect;

    #[test]
    fn introspection_metadata_lists_the_expected_surface() {
        let class = daemon_object_class().unwrap();
        let members = reflect::get_exposed_members(&class, true, true, false);
        for method in [
            "registered",
            "ping",
            "info",
            "get_metadata",
            "get_next_stream_item",
            "close_stream",
        ] {
            assert!(members.methods.contains(method), "missing {method}");
        }
        assert!(members.oneway.is_empty());
        assert!(members.attrs.is_empty());
    }

    #[test]
    fn daemon_handle_outlives_registration_but_not_the_daemon() {
        let daemon = Daemon::new(Config {
            host: "127.0.0.1".to_owned(),
            ..Config::default()
        })
        .unwrap();
        let obj = DaemonObject {
            daemon: Arc::downgrade(&daemon),
        };
        assert!(obj.daemon().is_ok());
        drop(daemon);
        assert!(obj.daemon().is_err());
    }
}
