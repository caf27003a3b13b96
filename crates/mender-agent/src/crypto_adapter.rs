use std::sync::Arc;

use mender_api::CryptoBackend;
use mender_artifact::SignatureVerifier;

/// Bridges the async [`CryptoBackend`] capability to the artifact parser's
/// synchronous [`SignatureVerifier`] contract.
///
/// `ArtifactParser::feed` is itself synchronous (it only ever acts on
/// bytes already in memory, §4.3), so `manifest.sig` verification — like
/// the per-chunk update-module dispatch it sits next to — is driven to
/// completion with a single-poll executor rather than requiring the
/// parser to become `async`. This is safe only because real backends
/// verify a detached signature with in-memory PEM/key material and no
/// `.await` point; see the identical reasoning in `mender-artifact`'s
/// `futures_block_on`.
pub struct CryptoBackendVerifier {
    backend: Arc<dyn CryptoBackend>,
}

impl CryptoBackendVerifier {
    pub fn new(backend: Arc<dyn CryptoBackend>) -> Self {
        Self { backend }
    }
}

impl SignatureVerifier for CryptoBackendVerifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        block_on(self.backend.verify_signature(data, signature)).unwrap_or(false)
    }
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
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
