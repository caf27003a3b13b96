use std::collections::HashMap;

use crate::error::ArtifactError;

/// Parsed `manifest` entry: a `sha256sum`-style checksum listing, one
/// `<hex digest>  <filename>` pair per line, matching the real mender-artifact
/// manifest text format.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    checksums: HashMap<String, String>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ArtifactError::Malformed(format!("manifest is not valid utf-8: {}", e)))?;
        let mut checksums = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let digest = parts
                .next()
                .ok_or_else(|| ArtifactError::Malformed(format!("malformed manifest line: {:?}", line)))?;
            let filename = parts
                .next()
                .map(str::trim)
                .ok_or_else(|| ArtifactError::Malformed(format!("malformed manifest line: {:?}", line)))?;
            checksums.insert(filename.to_string(), digest.to_lowercase());
        }
        Ok(Self { checksums })
    }

    pub fn expected_checksum(&self, filename: &str) -> Option<&str> {
        self.checksums.get(filename).map(|s| s.as_str())
    }

    pub fn verify(&self, filename: &str, actual_hex: &str) -> Result<(), ArtifactError> {
        match self.expected_checksum(filename) {
            Some(expected) if expected.eq_ignore_ascii_case(actual_hex) => Ok(()),
            Some(expected) => Err(ArtifactError::Integrity {
                file: filename.to_string(),
                expected: expected.to_string(),
                actual: actual_hex.to_string(),
            }),
            None => Err(ArtifactError::Malformed(format!(
                "manifest has no checksum entry for {:?}",
                filename
            ))),
        }
    }
}
