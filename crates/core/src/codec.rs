//! Opaque payloads and the artifact files they travel through.
//!
//! Task inputs and outputs cross thread, process and batch-system boundaries
//! as MessagePack blobs. The master never looks inside a [`Payload`]; only the
//! submitting caller and the registered function agree on its shape.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FarmError, FarmResult};

/// A MessagePack-encoded value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(#[serde(with = "serde_bytes")] Vec<u8>);

impl Payload {
    /// Serialize a value into a payload.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> FarmResult<Self> {
        Ok(Self(rmp_serde::to_vec_named(value)?))
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> FarmResult<T> {
        Ok(rmp_serde::from_slice(&self.0)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Write a payload to an artifact file, replacing any previous content.
pub fn write_artifact(payload: &Payload, path: &Path) -> FarmResult<()> {
    fs::write(path, payload.as_bytes())
        .map_err(|e| FarmError::Io(format!("failed to write {}: {e}", path.display())))
}

/// Read an artifact file back as a payload.
pub fn read_artifact(path: &Path) -> FarmResult<Payload> {
    fs::read(path)
        .map(Payload::from_bytes)
        .map_err(|e| FarmError::Io(format!("failed to read {}: {e}", path.display())))
}

/// Remove an artifact, ignoring a file that is already gone.
pub fn remove_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove artifact");
        }
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_into_wrong_type_is_codec_error() {
        let payload = Payload::encode(&"not a number").unwrap();
        let err = payload.decode::<Vec<i64>>().unwrap_err();
        assert!(matches!(err, FarmError::Codec(_)));
    }

    #[test]
    fn artifact_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in_task.dat");
        let payload = Payload::encode(&(vec![1i64, 2, 3],)).unwrap();

        write_artifact(&payload, &path).unwrap();
        let back = read_artifact(&path).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.decode::<(Vec<i64>,)>().unwrap().0, vec![1, 2, 3]);
    }

    #[test]
    fn reading_missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_artifact(&dir.path().join("nope.dat")).unwrap_err();
        assert!(matches!(err, FarmError::Io(_)));
    }

    #[test]
    fn remove_missing_artifact_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        remove_artifact(&dir.path().join("never-existed"));
    }
}
