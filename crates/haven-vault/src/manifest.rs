use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `{files: {name: sha256hex}, signature: hex, encrypted: bool}`
///
/// Built once by `SecurePackager::package` and never edited afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub files: BTreeMap<String, String>,
    pub signature: String,
    pub encrypted: bool,
}

/// The bytes covered by the signature. Field order is alphabetical and
/// `files` is a BTreeMap, so the encoding is canonical.
#[derive(Serialize)]
struct SignedBody<'a> {
    encrypted: bool,
    files: &'a BTreeMap<String, String>,
}

pub(crate) fn signed_body(
    files: &BTreeMap<String, String>,
    encrypted: bool,
) -> VaultResult<Vec<u8>> {
    serde_json::to_vec(&SignedBody { encrypted, files })
        .map_err(|e| VaultError::Serialization(format!("manifest body: {}", e)))
}

impl ExportManifest {
    pub fn signed_bytes(&self) -> VaultResult<Vec<u8>> {
        signed_body(&self.files, self.encrypted)
    }

    pub fn to_json(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| VaultError::Serialization(format!("manifest: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| VaultError::Serialization(format!("manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_body_is_canonical() {
        let mut files = BTreeMap::new();
        files.insert("Enrollment.csv".to_string(), "bb".to_string());
        files.insert("Client.csv".to_string(), "aa".to_string());
        let body = signed_body(&files, true).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"encrypted":true,"files":{"Client.csv":"aa","Enrollment.csv":"bb"}}"#
        );
    }

    #[test]
    fn test_json_layout() {
        let manifest = ExportManifest {
            files: BTreeMap::from([("Client.csv".to_string(), "aa".to_string())]),
            signature: "ff".to_string(),
            encrypted: false,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["files"]["Client.csv"], "aa");
        assert_eq!(value["signature"], "ff");
        assert_eq!(value["encrypted"], false);
        let back = ExportManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(back, manifest);
    }
}
