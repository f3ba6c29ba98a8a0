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

use uuid::Uuid;

use crate::connection::ConnId;
use crate::protocol;
use crate::protocol::Annotations;

/// Everything a handler may observe about the call it is serving. Built by
/// the dispatcher for each request and passed explicitly; oneway worker
/// threads get a clone taken at spawn time, so they stay valid after the
/// originating connection goes away.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub seq: u32,
    pub msg_flags: u16,
    pub serializer_id: u16,
    pub annotations: Annotations,
    pub client: ConnId,
    pub client_addr: String,
}

impl RequestContext {
    /// Correlation id from the CORR annotation when the caller sent one,
    /// freshly minted otherwise.
    pub fn correlation_from(annotations: &Annotations) -> Uuid {
        annotations
            .get(protocol::ANNOTATION_CORRELATION)
            .and_then(|bytes| Uuid::from_slice(bytes).ok())
            .unwrap_or_else(Uuid::new_v4)
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> RequestContext {
    RequestContext {
        correlation_id: Uuid::new_v4(),
        seq: 0,
        msg_flags: 0,
        serializer_id: 2,
        annotations: Annotations::new(),
        client: ConnId(0),
        client_addr: "test:0".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_is_taken_from_the_annotation() {
        let id = Uuid::new_v4();
        let mut annotations = Annotations::new();
        annotations.insert(
            protocol::ANNOTATION_CORRELATION.to_owned(),
            id.as_bytes().to_vec(),
        );
        assert_eq!(RequestContext::correlation_from(&annotations), id);
    }

    #[test]
    fn missing_or_malformed_annotation_mints_a_fresh_id() {
        let annotations = Annotations::new();
        let a = RequestContext::correlation_from(&annotations);
        let b = RequestContext::correlation_from(&annotations);
        assert_ne!(a, b);

        let mut annotations = Annotations::new();
        annotations.insert(protocol::ANNOTATION_CORRELATION.to_owned(), vec![1, 2, 3]);
        // 3 bytes is not a uuid; a fresh one is minted instead of failing.
        let _ = RequestContext::correlation_from(&annotations);
    }
}
