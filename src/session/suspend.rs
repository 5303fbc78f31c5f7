//! The checkpoint document.
//!
//! ```json
//! {
//!   "version": 1,
//!   "session": {
//!     "jobs": { "<id>": "<checksum>" },
//!     "results": { "<id>": [ { "outcome": "pass", ... } ] },
//!     "resource_map": { "<resource id>": [ { "key": "value" } ] },
//!     "desired_job_list": [], "mandatory_job_list": [],
//!     "bootstrap_job_list": [], "run_list": [],
//!     "via": { "<id>": "<generator id>" },
//!     "discoveries": [ { "via": "...", "namespace": "...", "fields": {} } ],
//!     "metadata": { "title": "...", "flags": ["incomplete"], ... }
//!   }
//! }
//! ```
//!
//! The document is stored gzip-compressed.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::state::{JobResult, SessionMetadata};
use super::{ResumeError, SessionResult};
use crate::resource::ResourceMap;
use crate::unit::FieldMap;

/// Version written by this build; older or newer documents are refused.
pub const SESSION_DOCUMENT_VERSION: u64 = 1;

/// A unit added at run time, in the order it was discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredUnit {
    /// The local or resource job whose output produced the unit.
    pub via: String,
    pub namespace: String,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub jobs: BTreeMap<String, String>,
    pub results: BTreeMap<String, Vec<JobResult>>,
    pub resource_map: ResourceMap,
    pub desired_job_list: Vec<String>,
    pub mandatory_job_list: Vec<String>,
    pub bootstrap_job_list: Vec<String>,
    pub run_list: Vec<String>,
    pub via: BTreeMap<String, String>,
    pub discoveries: Vec<DiscoveredUnit>,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub version: u64,
    pub session: SessionSnapshot,
}

impl SessionDocument {
    pub fn new(session: SessionSnapshot) -> Self {
        Self {
            version: SESSION_DOCUMENT_VERSION,
            session,
        }
    }

    /// Serializes and compresses the document.
    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Decompresses and parses a stored document, checking its version first.
    pub fn decode(data: &[u8]) -> Result<Self, ResumeError> {
        let mut json = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut json)
            .map_err(|e| ResumeError::Corrupted(e.to_string()))?;

        let value: serde_json::Value =
            serde_json::from_slice(&json).map_err(|e| ResumeError::Corrupted(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ResumeError::Corrupted("missing version".to_string()))?;
        if version != SESSION_DOCUMENT_VERSION {
            return Err(ResumeError::UnsupportedVersion(version));
        }
        serde_json::from_value(value).map_err(|e| ResumeError::Corrupted(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outcome;

    fn snapshot() -> SessionSnapshot {
        let mut results = BTreeMap::new();
        results.insert("ns::a".to_string(), vec![JobResult::new(Outcome::Pass)]);
        SessionSnapshot {
            jobs: [("ns::a".to_string(), "abc".to_string())].into_iter().collect(),
            results,
            resource_map: ResourceMap::new(),
            desired_job_list: vec!["ns::a".into()],
            mandatory_job_list: vec![],
            bootstrap_job_list: vec![],
            run_list: vec!["ns::a".into()],
            via: BTreeMap::new(),
            discoveries: vec![],
            metadata: SessionMetadata::new(Some("smoke".into())),
        }
    }

    #[test]
    fn test_encode_decode() {
        let document = SessionDocument::new(snapshot());
        let data = document.encode().unwrap();
        assert_eq!(SessionDocument::decode(&data).unwrap(), document);
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut document = SessionDocument::new(snapshot());
        document.version = 7;
        let data = document.encode().unwrap();
        assert_eq!(
            SessionDocument::decode(&data),
            Err(ResumeError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SessionDocument::decode(b"not gzip"),
            Err(ResumeError::Corrupted(_))
        ));
    }
}
