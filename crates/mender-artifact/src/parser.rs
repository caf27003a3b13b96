use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use mender_domain::{begins_with, ends_with};
use mender_update::UpdateModuleRegistry;

use crate::error::ArtifactError;
use crate::header_info::HeaderInfo;
use crate::manifest::Manifest;
use crate::tar::{self, BLOCK_SIZE};

/// Verifies a detached signature against a public key. Kept separate from
/// the agent's broader crypto capability trait so this crate doesn't need
/// to depend on `mender-agent`; the agent's `CryptoBackend` implementation
/// is handed in wrapped behind this narrower interface.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Init,
    Version,
    Manifest,
    ManifestSig,
    Header,
    Data,
    Done,
    Fail,
}

#[derive(Debug)]
pub enum ParseOutcome {
    NeedMoreInput,
    InProgress,
    Done { new_provides: HashMap<String, String> },
}

#[derive(Debug)]
pub struct Fed {
    pub consumed: usize,
    pub outcome: ParseOutcome,
}

/// One small (fully buffered) outer entry awaiting enough bytes to complete.
struct SmallEntry {
    name: String,
    total: u64,
    collected: Vec<u8>,
    padding_remaining: u64,
}

/// A `data/####.tar` outer entry being streamed straight through to an
/// update module rather than buffered.
struct DataEntry {
    outer_name: String,
    payload_index: usize,
    outer_remaining: u64,
    padding_remaining: u64,
    /// Set once the inner header is parsed; combined with `outer_name` to
    /// form the manifest key for the payload file itself (the manifest
    /// checksums the payload content, not the `data/####.tar` wrapper).
    inner_filename: Option<String>,
    /// Hashes only the inner file's body bytes, never the inner header or
    /// any padding/outer framing.
    hasher: Sha256,
    inner: InnerTarState,
}

enum InnerTarState {
    /// Collecting the 512-byte inner tar header.
    Header { collected: Vec<u8> },
    /// Streaming the single inner file's body to the update module.
    Body { filename: String, remaining: u64, padding_remaining: u64, offset: u64, total: u64 },
    /// Inner file closed; draining any trailing bytes of the outer entry
    /// (the mender-artifact convention puts exactly one file per payload
    /// tar, so this is just the outer entry's final padding/zero blocks).
    Drain,
}

/// Streaming, incremental parser for a nested-tar mender artifact (§4.3).
///
/// Bytes are pushed in via [`feed`](Self::feed) as they arrive from the
/// deployment-service download; the parser never requires the full
/// artifact (or even a full payload) to be resident in memory. A bounded
/// ring buffer holds at most `2 * stream_block + recv_buf_hint` bytes;
/// exceeding it while still needing more structure to make progress is an
/// out-of-memory condition, not a crash.
pub struct ArtifactParser {
    state: ParserState,
    buffer: VecDeque<u8>,
    max_buffer: usize,
    stream_block: usize,
    max_entry_size: u64,
    device_type: String,
    registry: Arc<UpdateModuleRegistry>,
    signature_verifier: Option<Arc<dyn SignatureVerifier>>,
    known_provides: HashMap<String, String>,

    manifest: Option<Manifest>,
    /// Raw `manifest` entry bytes, kept around only so `manifest.sig` (which
    /// signs them directly, not their parsed checksums) can be verified.
    manifest_bytes: Option<Vec<u8>>,
    header_info: Option<HeaderInfo>,
    small: Option<SmallEntry>,
    data: Option<DataEntry>,
    expect_manifest_sig: bool,
    next_payload_index: usize,
    /// `version`'s checksum can't be verified until `manifest` (which always
    /// follows it) has been parsed, so its digest waits here in the
    /// meantime.
    pending_checksum: Option<(String, String)>,
}

impl ArtifactParser {
    pub fn new(
        device_type: impl Into<String>,
        max_entry_size: u64,
        stream_block: usize,
        recv_buf_hint: usize,
        registry: Arc<UpdateModuleRegistry>,
        known_provides: HashMap<String, String>,
        signature_verifier: Option<Arc<dyn SignatureVerifier>>,
    ) -> Self {
        Self {
            state: ParserState::Init,
            buffer: VecDeque::new(),
            max_buffer: 2 * stream_block + recv_buf_hint,
            stream_block,
            max_entry_size,
            device_type: device_type.into(),
            registry,
            signature_verifier,
            known_provides,
            manifest: None,
            manifest_bytes: None,
            header_info: None,
            small: None,
            data: None,
            expect_manifest_sig: true,
            next_payload_index: 0,
            pending_checksum: None,
        }
    }

    pub fn header_info(&self) -> Option<&HeaderInfo> {
        self.header_info.as_ref()
    }

    /// Feed the next chunk of downloaded bytes. Always consumes everything
    /// handed to it into the internal buffer before processing — callers
    /// are expected to size their chunks to the `stream_block` they
    /// configured the parser with.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Fed, ArtifactError> {
        if self.state == ParserState::Fail {
            return Err(ArtifactError::Malformed("feed() called after parser failure".into()));
        }
        if self.state == ParserState::Done {
            return Ok(Fed { consumed: 0, outcome: ParseOutcome::Done { new_provides: HashMap::new() } });
        }

        if self.buffer.len() + bytes.len() > self.max_buffer {
            self.state = ParserState::Fail;
            return Err(ArtifactError::OutOfMemory(self.buffer.len() + bytes.len()));
        }
        self.buffer.extend(bytes.iter().copied());
        let consumed = bytes.len();

        let mut made_progress = false;
        loop {
            match self.step() {
                Ok(true) => {
                    made_progress = true;
                    if self.state == ParserState::Done {
                        let new_provides = self
                            .header_info
                            .as_ref()
                            .map(|h| h.artifact_provides.clone())
                            .unwrap_or_default();
                        return Ok(Fed { consumed, outcome: ParseOutcome::Done { new_provides } });
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    self.state = ParserState::Fail;
                    return Err(e);
                }
            }
        }

        Ok(Fed {
            consumed,
            outcome: if made_progress { ParseOutcome::InProgress } else { ParseOutcome::NeedMoreInput },
        })
    }

    /// Attempt one unit of forward progress. Returns `Ok(true)` if the
    /// buffer had enough bytes to advance, `Ok(false)` if more input is
    /// needed before anything further can happen.
    fn step(&mut self) -> Result<bool, ArtifactError> {
        match self.state {
            ParserState::Init => self.step_begin_entry(),
            ParserState::Version => self.step_small_entry(),
            ParserState::Manifest => self.step_small_entry(),
            ParserState::ManifestSig => self.step_small_entry(),
            ParserState::Header => self.step_small_entry(),
            ParserState::Data => self.step_data(),
            ParserState::Done | ParserState::Fail => Ok(false),
        }
    }

    /// Parse the next outer tar header and decide how its body will be
    /// consumed, enforcing the fixed entry order §4.3 specifies.
    fn step_begin_entry(&mut self) -> Result<bool, ArtifactError> {
        if self.buffer.len() < BLOCK_SIZE {
            return Ok(false);
        }
        let mut block = [0u8; BLOCK_SIZE];
        for b in block.iter_mut() {
            *b = self.buffer.pop_front().unwrap();
        }
        if tar::is_zero_block(&block) {
            // End of the outer archive. Only legal once every expected
            // entry has been seen.
            if self.header_info.is_none() {
                return Err(ArtifactError::Malformed("artifact ended before header.tar".into()));
            }
            self.state = ParserState::Done;
            return Ok(true);
        }
        let header = tar::parse_header(&block).map_err(ArtifactError::Malformed)?;
        if header.size > self.max_entry_size {
            return Err(ArtifactError::OutOfMemory(header.size as usize));
        }

        match self.expected_next_entry(&header.name) {
            NextEntry::SmallBuffered(state) => {
                self.small = Some(SmallEntry {
                    name: header.name,
                    total: header.size,
                    collected: Vec::with_capacity(header.size as usize),
                    padding_remaining: tar::blocks_for(header.size) * BLOCK_SIZE as u64 - header.size,
                });
                self.state = state;
            }
            NextEntry::Data => {
                let payload_index = self.next_payload_index;
                self.next_payload_index += 1;
                self.data = Some(DataEntry {
                    outer_name: header.name,
                    payload_index,
                    outer_remaining: header.size,
                    padding_remaining: tar::blocks_for(header.size) * BLOCK_SIZE as u64 - header.size,
                    inner_filename: None,
                    hasher: Sha256::new(),
                    inner: InnerTarState::Header { collected: Vec::with_capacity(BLOCK_SIZE) },
                });
                self.state = ParserState::Data;
            }
            NextEntry::Reject(msg) => return Err(ArtifactError::Malformed(msg)),
        }
        Ok(true)
    }

    fn expected_next_entry(&mut self, name: &str) -> NextEntry {
        match self.state {
            ParserState::Init => {
                if name == "version" {
                    NextEntry::SmallBuffered(ParserState::Version)
                } else {
                    NextEntry::Reject(format!("expected 'version' first, got {:?}", name))
                }
            }
            _ if name == "manifest" && self.manifest.is_none() => {
                NextEntry::SmallBuffered(ParserState::Manifest)
            }
            _ if name == "manifest.sig" && self.expect_manifest_sig => {
                NextEntry::SmallBuffered(ParserState::ManifestSig)
            }
            _ if begins_with(name, "header.tar") => NextEntry::SmallBuffered(ParserState::Header),
            _ if begins_with(name, "data/") && ends_with(name, ".tar") => NextEntry::Data,
            _ => NextEntry::Reject(format!("unexpected entry in artifact stream: {:?}", name)),
        }
    }

    fn step_small_entry(&mut self) -> Result<bool, ArtifactError> {
        let entry = self.small.as_mut().expect("small entry state without SmallEntry");
        let want = (entry.total - entry.collected.len() as u64).min(self.buffer.len() as u64) as usize;
        if want > 0 {
            entry.collected.extend(self.buffer.drain(..want));
        }
        if (entry.collected.len() as u64) < entry.total {
            return Ok(want > 0);
        }
        if entry.padding_remaining > 0 {
            let pad_avail = (entry.padding_remaining.min(self.buffer.len() as u64)) as usize;
            if pad_avail == 0 {
                return Ok(false);
            }
            self.buffer.drain(..pad_avail);
            entry.padding_remaining -= pad_avail as u64;
            if entry.padding_remaining > 0 {
                return Ok(true);
            }
        }

        let entry = self.small.take().unwrap();
        self.finish_small_entry(entry)?;
        Ok(true)
    }

    fn finish_small_entry(&mut self, entry: SmallEntry) -> Result<(), ArtifactError> {
        let digest = format!("{:x}", Sha256::digest(&entry.collected));

        match self.state {
            ParserState::Version => {
                // `version` holds a bare small integer; only format 3 is supported.
                let v: u32 = std::str::from_utf8(&entry.collected)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| ArtifactError::Malformed("version entry is not an integer".into()))?;
                if v != 3 {
                    return Err(ArtifactError::UnsupportedVersion(v));
                }
                debug!(version = v, "mender-artifact: version accepted");
                // `version` is always the first entry, before `manifest` —
                // its checksum can't be checked until the manifest arrives.
                self.pending_checksum = Some((entry.name.clone(), digest));
                self.state = ParserState::Init;
            }
            ParserState::Manifest => {
                let manifest = Manifest::parse(&entry.collected)?;
                if let Some((name, digest)) = self.pending_checksum.take() {
                    manifest.verify(&name, &digest)?;
                }
                self.manifest = Some(manifest);
                self.manifest_bytes = Some(entry.collected);
                self.state = ParserState::Init;
            }
            ParserState::ManifestSig => {
                self.expect_manifest_sig = false;
                if let Some(verifier) = &self.signature_verifier {
                    // manifest.sig is a detached signature over the raw
                    // manifest bytes, not over anything derived from them.
                    let manifest_bytes = self
                        .manifest_bytes
                        .as_ref()
                        .ok_or_else(|| ArtifactError::Malformed("manifest.sig before manifest".into()))?;
                    if !verifier.verify(manifest_bytes, &entry.collected) {
                        return Err(ArtifactError::Integrity {
                            file: "manifest.sig".into(),
                            expected: "valid signature".into(),
                            actual: "verification failed".into(),
                        });
                    }
                }
                self.state = ParserState::Init;
            }
            ParserState::Header => {
                self.expect_manifest_sig = false;
                self.verify_checksum(&entry.name, &digest)?;
                let bytes: std::borrow::Cow<[u8]> = if ends_with(&entry.name, ".gz") {
                    std::borrow::Cow::Owned(gunzip(&entry.collected)?)
                } else {
                    std::borrow::Cow::Borrowed(&entry.collected)
                };
                let info = decode_header_tar(&bytes)?;
                if !info.is_compatible_with(&self.device_type) {
                    return Err(ArtifactError::IncompatibleArtifact {
                        device_type: self.device_type.clone(),
                        supported: info.device_types_compatible.clone(),
                    });
                }
                #[cfg(feature = "provides-depends")]
                info.check_depends(&self.known_provides)?;
                #[cfg(not(feature = "provides-depends"))]
                let _ = &self.known_provides;

                for payload_type in &info.payload_types {
                    if self.registry.resolve(payload_type).is_err() {
                        return Err(ArtifactError::UnknownPayloadType(payload_type.clone()));
                    }
                }
                info!(artifact = %info.artifact_name, "mender-artifact: header accepted");
                self.header_info = Some(info);
                self.state = ParserState::Init;
            }
            _ => unreachable!("finish_small_entry called in unexpected state"),
        }
        Ok(())
    }

    fn verify_checksum(&self, name: &str, digest: &str) -> Result<(), ArtifactError> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| ArtifactError::Malformed(format!("{} seen before manifest", name)))?;
        manifest.verify(name, digest)
    }

    fn step_data(&mut self) -> Result<bool, ArtifactError> {
        let header_info = self
            .header_info
            .as_ref()
            .ok_or_else(|| ArtifactError::Malformed("data payload before header.tar".into()))?;

        let entry = self.data.as_mut().expect("Data state without DataEntry");
        let payload_type = header_info
            .payload_types
            .get(entry.payload_index)
            .cloned()
            .ok_or_else(|| {
                ArtifactError::Malformed(format!(
                    "no payload declared for data entry index {}",
                    entry.payload_index
                ))
            })?;

        match &mut entry.inner {
            InnerTarState::Header { collected } => {
                let want = (BLOCK_SIZE - collected.len()).min(self.buffer.len());
                if want == 0 {
                    return Ok(false);
                }
                let drained: Vec<u8> = self.buffer.drain(..want).collect();
                entry.outer_remaining -= want as u64;
                collected.extend(drained);
                if collected.len() < BLOCK_SIZE {
                    return Ok(true);
                }
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(collected);
                let inner_header = tar::parse_header(&block).map_err(ArtifactError::Malformed)?;
                let total = inner_header.size;
                entry.inner_filename = Some(inner_header.name.clone());
                entry.inner = InnerTarState::Body {
                    filename: inner_header.name,
                    remaining: total,
                    padding_remaining: tar::blocks_for(total) * BLOCK_SIZE as u64 - total,
                    offset: 0,
                    total,
                };
                Ok(true)
            }
            InnerTarState::Body { filename, remaining, padding_remaining, offset, total } => {
                if *remaining > 0 {
                    let want = (*remaining).min(self.buffer.len() as u64).min(self.stream_block as u64);
                    if want == 0 {
                        return Ok(false);
                    }
                    let chunk: Vec<u8> = self.buffer.drain(..want as usize).collect();
                    entry.hasher.update(&chunk);
                    entry.outer_remaining -= want;
                    *remaining -= want;
                    let module = self.registry.resolve(&payload_type)?;
                    let fut = module.download_artifact_flash(&chunk, *offset, *total, filename);
                    futures_block_on(fut)?;
                    *offset += want;
                    return Ok(true);
                }
                if *padding_remaining > 0 {
                    let want = (*padding_remaining).min(self.buffer.len() as u64);
                    if want == 0 {
                        return Ok(false);
                    }
                    self.buffer.drain(..want as usize);
                    entry.outer_remaining -= want;
                    *padding_remaining -= want;
                    if *padding_remaining > 0 {
                        return Ok(true);
                    }
                }
                let module = self.registry.resolve(&payload_type)?;
                futures_block_on(module.end_of_payload())?;
                entry.inner = InnerTarState::Drain;
                Ok(true)
            }
            InnerTarState::Drain => {
                if entry.outer_remaining > 0 {
                    let want = entry.outer_remaining.min(self.buffer.len() as u64);
                    if want == 0 {
                        return Ok(false);
                    }
                    self.buffer.drain(..want as usize);
                    entry.outer_remaining -= want;
                    return Ok(true);
                }
                if entry.padding_remaining > 0 {
                    let want = entry.padding_remaining.min(self.buffer.len() as u64);
                    if want == 0 {
                        return Ok(false);
                    }
                    self.buffer.drain(..want as usize);
                    entry.padding_remaining -= want;
                    if entry.padding_remaining > 0 {
                        return Ok(true);
                    }
                }
                let entry = self.data.take().unwrap();
                let digest = format!("{:x}", entry.hasher.finalize());
                let inner_filename = entry
                    .inner_filename
                    .as_deref()
                    .ok_or_else(|| ArtifactError::Malformed("data entry closed before inner header".into()))?;
                let key = format!("{}/{}", entry.outer_name, inner_filename);
                self.verify_checksum(&key, &digest)?;
                self.state = ParserState::Init;
                Ok(true)
            }
        }
    }
}

enum NextEntry {
    SmallBuffered(ParserState),
    Data,
    Reject(String),
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, ArtifactError> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ArtifactError::Malformed(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

fn decode_header_tar(bytes: &[u8]) -> Result<HeaderInfo, ArtifactError> {
    // header.tar is a small, fully-buffered nested tar. `header-info` is
    // always read (it's what the parser needs to dispatch payloads); with
    // the `full-parse` feature, per-payload `headers/####/meta-data`
    // entries are also decoded and attached to the result (§6
    // `FULL_PARSE_ARTIFACT`). Either way the whole inner tar is scanned
    // rather than returning on the first match, since `header-info`'s
    // position relative to the `headers/` entries isn't guaranteed.
    let mut header_info: Option<HeaderInfo> = None;
    #[cfg(feature = "full-parse")]
    let mut payload_meta: HashMap<String, serde_json::Value> = HashMap::new();

    let mut offset = 0usize;
    while offset + BLOCK_SIZE <= bytes.len() {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&bytes[offset..offset + BLOCK_SIZE]);
        offset += BLOCK_SIZE;
        if tar::is_zero_block(&block) {
            continue;
        }
        let header = tar::parse_header(&block).map_err(ArtifactError::Malformed)?;
        let size = header.size as usize;
        if offset + size > bytes.len() {
            return Err(ArtifactError::Malformed(format!(
                "header.tar entry {:?} truncated",
                header.name
            )));
        }
        let content = &bytes[offset..offset + size];
        let padded = tar::blocks_for(header.size) as usize * BLOCK_SIZE;
        offset += padded;

        if header.name == "header-info" {
            header_info = Some(HeaderInfo::parse(content)?);
            continue;
        }

        #[cfg(feature = "full-parse")]
        if begins_with(&header.name, "headers/") && ends_with(&header.name, "meta-data") {
            let key = header
                .name
                .strip_prefix("headers/")
                .and_then(|rest| rest.split('/').next())
                .unwrap_or(&header.name)
                .to_string();
            let value: serde_json::Value = serde_json::from_slice(content).map_err(|e| {
                ArtifactError::Malformed(format!("{:?} is not valid json: {}", header.name, e))
            })?;
            payload_meta.insert(key, value);
        }
    }

    let mut info = header_info
        .ok_or_else(|| ArtifactError::Malformed("header.tar has no header-info entry".into()))?;
    #[cfg(feature = "full-parse")]
    {
        info.payload_meta = payload_meta;
    }
    Ok(info)
}

/// The update-module trait is `async`, but the parser's own API is
/// synchronous (feed() drives everything off whatever bytes are already in
/// memory). Module calls made mid-parse are expected to be fast, in-memory
/// writes; this drives them to completion on the current thread using a
/// minimal single-poll executor rather than pulling in a full async
/// runtime dependency here.
fn futures_block_on<F: std::future::Future>(fut: F) -> F::Output {
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    loop {
        if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
            return v;
        }
    }
}
