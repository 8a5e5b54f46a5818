//! In-crate test doubles.

use crate::context::EncryptionContext;
use crate::error::ProviderError;
use crate::provider::{CryptoProvider, DecryptRequest, Sealed, TermRequest};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KEY: [u8; 32] = [42u8; 32];
const TAG_SIZE: usize = 16;

#[derive(Default)]
struct State {
    nonce: AtomicU64,
    transient_failures: AtomicU32,
    fail_bulk: AtomicBool,
    encrypt_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    term_calls: AtomicUsize,
    delay_ms: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Marks one provider call as in flight until dropped.
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// HMAC-keystream "cipher" with an HMAC tag. Not secure; only shaped like a
/// real provider: randomized output, authenticated context, keyed tags.
#[derive(Clone, Default)]
pub(crate) struct MockProvider {
    state: Arc<State>,
}

fn mac(parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(&KEY).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac
}

fn keystream(context: &EncryptionContext, nonce: &[u8], len: usize) -> Vec<u8> {
    let ctx = context.to_string();
    let mut out = Vec::with_capacity(len + 32);
    let mut block = 0u32;
    while out.len() < len {
        let counter = block.to_be_bytes();
        let parts = [b"ks".as_slice(), ctx.as_bytes(), nonce, counter.as_slice()];
        out.extend_from_slice(&mac(&parts).finalize().into_bytes());
        block += 1;
    }
    out.truncate(len);
    out
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with `Unavailable`.
    pub(crate) fn fail_next(&self, n: u32) {
        self.state.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Makes every `decrypt_bulk` call fail permanently.
    pub(crate) fn fail_bulk(&self) {
        self.state.fail_bulk.store(true, Ordering::SeqCst);
    }

    /// Delays every call.
    pub(crate) fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn encrypt_calls(&self) -> usize {
        self.state.encrypt_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn decrypt_calls(&self) -> usize {
        self.state.decrypt_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn bulk_calls(&self) -> usize {
        self.state.bulk_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn term_calls(&self) -> usize {
        self.state.term_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls seen in flight at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_peak(&self) {
        self.state.peak.store(0, Ordering::SeqCst);
    }

    fn enter(&self) -> Active<'_> {
        let now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        Active(&self.state.active)
    }

    async fn gate(&self) -> Result<(), ProviderError> {
        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .state
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Unavailable("mock outage".to_string()));
        }
        Ok(())
    }

    fn open(request: DecryptRequest<'_>) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        if request.key_id != "mock" {
            return Err(ProviderError::KeyNotFound(request.key_id.to_string()));
        }
        let data = request.ciphertext;
        if data.len() < 8 + TAG_SIZE {
            return Err(ProviderError::Rejected);
        }
        let (nonce, rest) = data.split_at(8);
        let (body, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let ctx = request.context.to_string();
        let expected =
            mac(&[b"tag".as_slice(), ctx.as_bytes(), nonce, body]).finalize().into_bytes();
        if !bool::from(expected[..TAG_SIZE].ct_eq(tag)) {
            return Err(ProviderError::Rejected);
        }
        let ks = keystream(request.context, nonce, body.len());
        Ok(Zeroizing::new(body.iter().zip(ks).map(|(b, k)| b ^ k).collect()))
    }
}

#[async_trait]
impl CryptoProvider for MockProvider {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Sealed, ProviderError> {
        self.state.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.enter();
        self.gate().await?;

        let nonce = self.state.nonce.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        let ks = keystream(context, &nonce, plaintext.len());
        let body: Vec<u8> = plaintext.iter().zip(ks).map(|(p, k)| p ^ k).collect();
        let ctx = context.to_string();
        let parts = [b"tag".as_slice(), ctx.as_bytes(), nonce.as_slice(), body.as_slice()];
        let tag = mac(&parts).finalize().into_bytes();

        let mut ciphertext = nonce.to_vec();
        ciphertext.extend_from_slice(&body);
        ciphertext.extend_from_slice(&tag[..TAG_SIZE]);
        Ok(Sealed { key_id: "mock".to_string(), ciphertext })
    }

    async fn decrypt(
        &self,
        request: DecryptRequest<'_>,
    ) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        self.state.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.enter();
        self.gate().await?;
        Self::open(request)
    }

    async fn decrypt_bulk(
        &self,
        requests: &[DecryptRequest<'_>],
    ) -> Result<Vec<Zeroizing<Vec<u8>>>, ProviderError> {
        self.state.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.enter();
        self.gate().await?;
        if self.state.fail_bulk.load(Ordering::SeqCst) {
            return Err(ProviderError::Failed("bulk endpoint disabled".to_string()));
        }
        requests.iter().map(|r| Self::open(*r)).collect()
    }

    async fn derive_terms(&self, requests: &[TermRequest]) -> Result<Vec<Vec<u8>>, ProviderError> {
        self.state.term_calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.enter();
        self.gate().await?;
        Ok(requests
            .iter()
            .map(|r| {
                let ctx = r.context.to_string();
                let parts = [b"term".as_slice(), ctx.as_bytes(), &[0u8][..], r.input.as_slice()];
                mac(&parts).finalize().into_bytes().to_vec()
            })
            .collect())
    }
}

/// Counts events emitted on the `fieldseal::integrity` target.
struct IntegrityEvents(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for IntegrityEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() == "fieldseal::integrity" {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Runs `f` and returns how many integrity violations it logged.
pub(crate) fn integrity_events(f: impl FnOnce()) -> usize {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(IntegrityEvents(Arc::clone(&count)));
    tracing::subscriber::with_default(subscriber, f);
    count.load(Ordering::SeqCst)
}
