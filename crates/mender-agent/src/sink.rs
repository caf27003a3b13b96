use std::collections::HashMap;

use mender_api::ArtifactSink;
use mender_artifact::{ArtifactParser, ParseOutcome};

/// Adapts the streaming [`ArtifactParser`] to the narrow [`ArtifactSink`]
/// interface `mender-api`'s downloader drives, so `mender-api` never needs
/// to depend on `mender-artifact` directly (§9: the original's `void*`
/// event-callback duality collapses into one typed interface per
/// direction rather than a single polymorphic callback).
pub struct ParserSink<'a> {
    parser: &'a mut ArtifactParser,
    pub new_provides: HashMap<String, String>,
}

impl<'a> ParserSink<'a> {
    pub fn new(parser: &'a mut ArtifactParser) -> Self {
        Self { parser, new_provides: HashMap::new() }
    }
}

impl<'a> ArtifactSink for ParserSink<'a> {
    fn feed(&mut self, bytes: &[u8]) -> Result<bool, String> {
        let fed = self.parser.feed(bytes).map_err(|e| e.to_string())?;
        match fed.outcome {
            ParseOutcome::Done { new_provides } => {
                self.new_provides = new_provides;
                Ok(true)
            }
            ParseOutcome::InProgress | ParseOutcome::NeedMoreInput => Ok(false),
        }
    }
}
