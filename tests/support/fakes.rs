use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use peer_swap::swap::services::BroadcastTx;
use peer_swap::swap::{
    Asset, ChainClient, DecodedInvoice, LightningClient, MessageType, Messenger, OpeningParams,
    OpeningTx, PeerMessage, Policy, SharedSwap, SqliteSwapStore, StateType, SwapService,
    SwapServiceConfig, SwapServices, SwapStore,
};

pub const OPENING_FEE_SAT: u64 = 1_000;
pub const START_HEIGHT: u32 = 100;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub msg_type: String,
    pub payload: Vec<u8>,
}

/// Messenger whose sends land in an in-process queue read by the test.
pub struct ConnectedMessenger {
    local_id: String,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl ConnectedMessenger {
    pub fn new(local_id: &str) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id: local_id.to_string(),
                outbox,
            },
            rx,
        )
    }
}

#[async_trait]
impl Messenger for ConnectedMessenger {
    async fn send_message(&self, peer_id: &str, message: &PeerMessage) -> Result<()> {
        let (msg_type, payload) = message.encode()?;
        self.outbox
            .send(Envelope {
                from: self.local_id.clone(),
                to: peer_id.to_string(),
                msg_type,
                payload,
            })
            .map_err(|_| anyhow::anyhow!("peer {peer_id} disconnected"))
    }
}

/// Invoices look like `lnfake:<amount_msat>:<label>`.
#[derive(Default)]
pub struct FakeLightning {
    pub fail_pay: AtomicBool,
    pub fail_rebalance: AtomicBool,
    pub paid: Mutex<Vec<String>>,
    /// Labels handed back after a restart.
    pub tracked: Mutex<Vec<String>>,
}

impl FakeLightning {
    pub fn paid(&self) -> Vec<String> {
        self.paid.lock().expect("paid mutex poisoned").clone()
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.lock().expect("tracked mutex poisoned").clone()
    }

    fn record_payment(&self, invoice: &str) -> Result<String> {
        let decoded = decode_fake(invoice)?;
        self.paid
            .lock()
            .expect("paid mutex poisoned")
            .push(invoice.to_string());
        Ok(format!("preimage:{}", decoded.payment_hash))
    }
}

fn decode_fake(invoice: &str) -> Result<DecodedInvoice> {
    let mut parts = invoice.splitn(3, ':');
    let (Some("lnfake"), Some(amount), Some(label)) = (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("not a fake invoice: {invoice}");
    };
    Ok(DecodedInvoice {
        amount_msat: amount.parse().context("parse invoice amount")?,
        payment_hash: format!("hash:{label}"),
    })
}

#[async_trait]
impl LightningClient for FakeLightning {
    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice> {
        decode_fake(invoice)
    }

    async fn create_invoice(
        &self,
        amount_msat: u64,
        label: &str,
        _expiry_secs: u32,
    ) -> Result<String> {
        Ok(format!("lnfake:{amount_msat}:{label}"))
    }

    fn track_invoice(&self, label: &str, invoice: &str) -> Result<()> {
        decode_fake(invoice)?;
        self.tracked
            .lock()
            .expect("tracked mutex poisoned")
            .push(label.to_string());
        Ok(())
    }

    async fn pay_invoice(&self, invoice: &str) -> Result<String> {
        if self.fail_pay.load(Ordering::SeqCst) {
            anyhow::bail!("no route");
        }
        self.record_payment(invoice)
    }

    async fn rebalance(&self, invoice: &str, _channel_id: &str) -> Result<String> {
        if self.fail_rebalance.load(Ordering::SeqCst) {
            anyhow::bail!("no route");
        }
        self.record_payment(invoice)
    }
}

pub struct FakeChain {
    pub height: AtomicU32,
    pub valid: AtomicBool,
    /// Number of upcoming claim attempts that fail.
    pub failing_claims: AtomicU32,
    pub openings: AtomicUsize,
    pub claim_attempts: AtomicUsize,
    pub watched_txs: Mutex<Vec<(String, String)>>,
    pub watched_cltvs: Mutex<Vec<(String, u32)>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self {
            height: AtomicU32::new(START_HEIGHT),
            valid: AtomicBool::new(true),
            failing_claims: AtomicU32::new(0),
            openings: AtomicUsize::new(0),
            claim_attempts: AtomicUsize::new(0),
            watched_txs: Mutex::new(Vec::new()),
            watched_cltvs: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChain {
    fn claim(&self, kind: &str, tx_id: &str) -> Result<String> {
        self.claim_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_claims.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_claims.store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("mempool rejected claim");
        }
        Ok(format!("claim-{kind}:{tx_id}"))
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn opening_fee_estimate(&self) -> Result<u64> {
        Ok(OPENING_FEE_SAT)
    }

    async fn block_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn create_opening_transaction(&self, params: &OpeningParams) -> Result<OpeningTx> {
        Ok(OpeningTx {
            unprepared_hex: format!("unprepared:{}", params.claim_payment_hash),
            vout: 0,
            fee_sat: OPENING_FEE_SAT,
        })
    }

    async fn broadcast_opening_transaction(&self, unprepared_hex: &str) -> Result<BroadcastTx> {
        let n = self.openings.fetch_add(1, Ordering::SeqCst);
        Ok(BroadcastTx {
            tx_id: format!("opening-tx-{n}"),
            tx_hex: format!("signed:{unprepared_hex}"),
        })
    }

    async fn add_wait_for_confirmation(&self, swap_id: &str, tx_id: &str) -> Result<()> {
        self.watched_txs
            .lock()
            .expect("watched txs mutex poisoned")
            .push((swap_id.to_string(), tx_id.to_string()));
        Ok(())
    }

    async fn add_wait_for_cltv(&self, swap_id: &str, cltv: u32) -> Result<()> {
        self.watched_cltvs
            .lock()
            .expect("watched cltvs mutex poisoned")
            .push((swap_id.to_string(), cltv));
        Ok(())
    }

    async fn validate_transaction(&self, _params: &OpeningParams, _tx_id: &str) -> Result<bool> {
        Ok(self.valid.load(Ordering::SeqCst))
    }

    async fn claim_with_preimage(
        &self,
        _params: &OpeningParams,
        _preimage: &str,
        tx_id: &str,
        _vout: u32,
    ) -> Result<String> {
        self.claim("preimage", tx_id)
    }

    async fn claim_with_cltv(
        &self,
        _params: &OpeningParams,
        tx_id: &str,
        _vout: u32,
    ) -> Result<String> {
        self.claim("cltv", tx_id)
    }
}

pub struct TestPolicy {
    pub accept: AtomicBool,
    pub pay_fee: AtomicBool,
}

impl Default for TestPolicy {
    fn default() -> Self {
        Self {
            accept: AtomicBool::new(true),
            pay_fee: AtomicBool::new(true),
        }
    }
}

impl Policy for TestPolicy {
    fn should_accept_swap(
        &self,
        _peer_id: &str,
        _channel_id: &str,
        _asset: Asset,
        _amount: u64,
    ) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn should_pay_fee(
        &self,
        _swap_amount: u64,
        _fee_sat: u64,
        _peer_id: &str,
        _channel_id: &str,
    ) -> bool {
        self.pay_fee.load(Ordering::SeqCst)
    }
}

pub fn test_config() -> SwapServiceConfig {
    SwapServiceConfig {
        max_action_retries: 2,
        retry_backoff_ms: 0,
        ..SwapServiceConfig::default()
    }
}

/// One swap peer with fake collaborators.
pub struct Node {
    pub id: String,
    pub service: Arc<SwapService>,
    pub lightning: Arc<FakeLightning>,
    pub chain: Arc<FakeChain>,
    pub policy: Arc<TestPolicy>,
}

impl Node {
    /// Returns the node and the queue of messages it sends.
    pub fn new(id: &str, store: Arc<dyn SwapStore>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (messenger, outbox) = ConnectedMessenger::new(id);
        let lightning = Arc::new(FakeLightning::default());
        let chain = Arc::new(FakeChain::default());
        let policy = Arc::new(TestPolicy::default());
        let services = SwapServices {
            store,
            lightning: lightning.clone(),
            messenger: Arc::new(messenger),
            policy: policy.clone(),
            bitcoin: Some(chain.clone()),
            liquid: Some(chain.clone()),
            config: test_config(),
        };
        let node = Self {
            id: id.to_string(),
            service: Arc::new(SwapService::new(services)),
            lightning,
            chain,
            policy,
        };
        (node, outbox)
    }

    pub fn in_memory(id: &str) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let store = SqliteSwapStore::open_in_memory().context("open in-memory store")?;
        Ok(Self::new(id, Arc::new(store)))
    }

    pub fn services(&self) -> &SwapServices {
        self.service.services()
    }

    pub async fn state(&self, swap_id: &str) -> Result<StateType> {
        Ok(self.service.get_active_swap(swap_id)?.lock().await.current)
    }
}

/// Hands the oldest queued message to `to`.
pub async fn deliver(
    to: &Node,
    outbox: &mut mpsc::UnboundedReceiver<Envelope>,
) -> Result<MessageType> {
    let envelope = outbox.try_recv().context("no message in flight")?;
    anyhow::ensure!(envelope.to == to.id, "message for {} delivered to {}", envelope.to, to.id);
    let msg_type = MessageType::from_hex(&envelope.msg_type)?;
    to.service
        .on_message_received(&envelope.from, &envelope.msg_type, &envelope.payload)
        .await
        .with_context(|| format!("{} handles {msg_type}", to.id))?;
    Ok(msg_type)
}

pub async fn swap_id(swap: &SharedSwap) -> String {
    swap.lock().await.id.clone()
}
