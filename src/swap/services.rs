use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::error::SwapError;
use super::messages::PeerMessage;
use super::service::SwapServiceConfig;
use super::store::SwapStore;
use super::Asset;

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, peer_id: &str, message: &PeerMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub amount_msat: u64,
    pub payment_hash: String,
}

#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice>;

    /// Creates an invoice whose settlement is reported back with `label`.
    async fn create_invoice(&self, amount_msat: u64, label: &str, expiry_secs: u32)
    -> Result<String>;

    /// Reports settlement of an invoice issued before a restart with `label`.
    fn track_invoice(&self, label: &str, invoice: &str) -> Result<()>;

    /// Pays the invoice and returns the preimage as hex.
    async fn pay_invoice(&self, invoice: &str) -> Result<String>;

    /// Pays the invoice through `channel_id` and returns the preimage as hex.
    async fn rebalance(&self, invoice: &str, channel_id: &str) -> Result<String>;
}

/// Parameters of the HTLC output locking the on-chain leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningParams {
    pub asset: Asset,
    pub amount: u64,
    pub maker_pubkey_hash: String,
    pub taker_pubkey_hash: String,
    pub claim_payment_hash: String,
    pub cltv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningTx {
    pub unprepared_hex: String,
    pub vout: u32,
    pub fee_sat: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTx {
    pub tx_id: String,
    pub tx_hex: String,
}

/// Chain backend and watcher for one asset. Confirmation and expiry callbacks are
/// delivered to the swap service keyed by swap id.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn opening_fee_estimate(&self) -> Result<u64>;

    async fn block_height(&self) -> Result<u32>;

    async fn create_opening_transaction(&self, params: &OpeningParams) -> Result<OpeningTx>;

    async fn broadcast_opening_transaction(&self, unprepared_hex: &str) -> Result<BroadcastTx>;

    async fn add_wait_for_confirmation(&self, swap_id: &str, tx_id: &str) -> Result<()>;

    async fn add_wait_for_cltv(&self, swap_id: &str, cltv: u32) -> Result<()>;

    async fn validate_transaction(&self, params: &OpeningParams, tx_id: &str) -> Result<bool>;

    /// Spends the opening output with the preimage, returns the claim tx id.
    async fn claim_with_preimage(
        &self,
        params: &OpeningParams,
        preimage: &str,
        tx_id: &str,
        vout: u32,
    ) -> Result<String>;

    /// Spends the opening output back to the maker after expiry, returns the claim tx id.
    async fn claim_with_cltv(&self, params: &OpeningParams, tx_id: &str, vout: u32)
    -> Result<String>;
}

pub trait Policy: Send + Sync {
    fn should_accept_swap(&self, peer_id: &str, channel_id: &str, asset: Asset, amount: u64)
    -> bool;

    /// Gate for paying a swap-out fee invoice. No default: whether fees are
    /// gated at all is up to the policy implementation.
    fn should_pay_fee(&self, swap_amount: u64, fee_sat: u64, peer_id: &str, channel_id: &str)
    -> bool;
}

/// Collaborators handed to every action.
#[derive(Clone)]
pub struct SwapServices {
    pub store: Arc<dyn SwapStore>,
    pub lightning: Arc<dyn LightningClient>,
    pub messenger: Arc<dyn Messenger>,
    pub policy: Arc<dyn Policy>,
    pub bitcoin: Option<Arc<dyn ChainClient>>,
    pub liquid: Option<Arc<dyn ChainClient>>,
    pub config: SwapServiceConfig,
}

impl SwapServices {
    pub fn onchain(&self, asset: Asset) -> Result<&Arc<dyn ChainClient>, SwapError> {
        match asset {
            Asset::Btc => self.bitcoin.as_ref(),
            Asset::LBtc => self.liquid.as_ref(),
        }
        .ok_or_else(|| SwapError::UnsupportedAsset(asset.to_string()))
    }

    pub fn cltv_delta(&self, asset: Asset) -> u32 {
        match asset {
            Asset::Btc => self.config.bitcoin_cltv_delta,
            Asset::LBtc => self.config.liquid_cltv_delta,
        }
    }
}
