use std::collections::HashMap;

use serde_json::Value;

use crate::error::ArtifactError;

/// Parsed `header-info` JSON: the only header file guaranteed to be read
/// regardless of the `full-parse` feature, since it's what the parser needs
/// to know which update module each `data/####.tar` payload dispatches to.
#[derive(Debug, Clone, Default)]
pub struct HeaderInfo {
    pub artifact_name: String,
    pub payload_types: Vec<String>,
    pub device_types_compatible: Vec<String>,
    pub artifact_provides: HashMap<String, String>,
    pub artifact_depends: HashMap<String, Vec<String>>,
    /// Per-payload `headers/####/meta-data` JSON, keyed by the `####`
    /// path segment. Only populated when the `full-parse` cargo feature
    /// is enabled (§6 `FULL_PARSE_ARTIFACT`); empty otherwise.
    pub payload_meta: HashMap<String, Value>,
}

impl HeaderInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let v: Value = serde_json::from_slice(bytes)
            .map_err(|e| ArtifactError::Malformed(format!("header-info is not valid json: {}", e)))?;

        let artifact_name = v
            .get("artifact_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ArtifactError::Malformed("header-info missing artifact_name".into()))?
            .to_string();

        let device_types_compatible = v
            .get("device_types_compatible")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ArtifactError::Malformed("header-info missing device_types_compatible".into())
            })?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        let payload_types = v
            .get("payloads")
            .and_then(Value::as_array)
            .ok_or_else(|| ArtifactError::Malformed("header-info missing payloads".into()))?
            .iter()
            .map(|p| {
                p.get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ArtifactError::Malformed("payload entry missing type".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let artifact_provides = v
            .get("artifact_provides")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let artifact_depends = v
            .get("artifact_depends")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let values = match v {
                            Value::Array(arr) => {
                                arr.iter().filter_map(Value::as_str).map(str::to_string).collect()
                            }
                            Value::String(s) => vec![s.clone()],
                            _ => vec![],
                        };
                        (k.clone(), values)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            artifact_name,
            payload_types,
            device_types_compatible,
            artifact_provides,
            artifact_depends,
            payload_meta: HashMap::new(),
        })
    }

    pub fn is_compatible_with(&self, device_type: &str) -> bool {
        self.device_types_compatible.iter().any(|d| d == device_type)
    }

    /// Checks every depends key against the device's currently known
    /// provides, behind the `provides-depends` feature (§6).
    pub fn check_depends(&self, known_provides: &HashMap<String, String>) -> Result<(), ArtifactError> {
        for (key, expected) in &self.artifact_depends {
            let actual = known_provides.get(key).cloned().unwrap_or_default();
            if !expected.iter().any(|e| e == &actual) {
                return Err(ArtifactError::DependsNotSatisfied {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual: vec![actual],
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_header_info() {
        let json = br#"{
            "artifact_name": "release-1",
            "device_types_compatible": ["raspberrypi4"],
            "payloads": [{"type": "rootfs-image"}]
        }"#;
        let info = HeaderInfo::parse(json).unwrap();
        assert_eq!(info.artifact_name, "release-1");
        assert_eq!(info.payload_types, vec!["rootfs-image".to_string()]);
        assert!(info.is_compatible_with("raspberrypi4"));
        assert!(!info.is_compatible_with("other-device"));
    }

    #[test]
    fn depends_checked_against_provides() {
        let json = br#"{
            "artifact_name": "release-1",
            "device_types_compatible": ["raspberrypi4"],
            "payloads": [{"type": "rootfs-image"}],
            "artifact_depends": {"rootfs-image.checksum": ["abc123"]}
        }"#;
        let info = HeaderInfo::parse(json).unwrap();
        let mut provides = HashMap::new();
        provides.insert("rootfs-image.checksum".to_string(), "abc123".to_string());
        assert!(info.check_depends(&provides).is_ok());

        provides.insert("rootfs-image.checksum".to_string(), "wrong".to_string());
        assert!(info.check_depends(&provides).is_err());
    }
}
