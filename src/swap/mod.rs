pub mod actions;
pub mod error;
pub mod fsm;
pub mod messages;
pub mod service;
pub mod services;
pub mod states;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{Hash as _, hash160};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

pub use error::SwapError;
pub use fsm::{EventType, StateType, SwapStateMachine};
pub use messages::{ClaimType, MessageType, PeerMessage};
pub use service::{SharedSwap, SwapNotification, SwapService, SwapServiceConfig};
pub use services::{
    ChainClient, DecodedInvoice, LightningClient, Messenger, OpeningParams, OpeningTx, Policy,
    SwapServices,
};
pub use store::{SqliteSwapStore, SwapStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    Sender,
    Receiver,
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwapType::Out => "out",
            SwapType::In => "in",
        })
    }
}

impl fmt::Display for SwapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwapRole::Sender => "sender",
            SwapRole::Receiver => "receiver",
        })
    }
}

/// On-chain leg of a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "btc")]
    Btc,
    #[serde(rename = "l-btc")]
    LBtc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "btc",
            Asset::LBtc => "l-btc",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(Asset::Btc),
            "l-btc" => Ok(Asset::LBtc),
            other => Err(SwapError::UnsupportedAsset(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or mismatched data from the counterparty.
    Protocol,
    /// A collaborator (lightning node, chain backend, transport) failed.
    Infrastructure,
    /// The engine received an event the current state does not handle.
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: u64,
}

/// Persisted business state of one swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapData {
    pub id: String,
    pub swap_type: SwapType,
    pub role: SwapRole,
    pub protocol_version: u64,
    pub created_at: u64,
    pub initiator_node_id: String,
    pub peer_node_id: String,
    pub channel_id: String,
    pub asset: Asset,
    pub amount: u64,

    pub privkey_hex: Option<String>,
    pub maker_pubkey_hash: Option<String>,
    pub taker_pubkey_hash: Option<String>,
    pub cltv: Option<u32>,

    pub fee_invoice: Option<String>,
    pub fee_preimage: Option<String>,
    pub claim_invoice: Option<String>,
    pub claim_payment_hash: Option<String>,
    pub claim_preimage: Option<String>,

    pub opening_tx_id: Option<String>,
    pub opening_tx_unprepared_hex: Option<String>,
    pub opening_tx_hex: Option<String>,
    pub opening_tx_vout: Option<u32>,
    pub opening_tx_fee: Option<u64>,
    pub claim_tx_id: Option<String>,
    pub cancel_message: Option<String>,

    /// Outbound message staged for the next send step; cleared once sent.
    pub next_message: Option<PeerMessage>,

    pub last_err: Option<ErrorRecord>,
    pub last_err_string: Option<String>,
}

impl SwapData {
    /// The maker funds the opening transaction and may reclaim it after the CLTV.
    pub fn is_maker(&self) -> bool {
        matches!(
            (self.swap_type, self.role),
            (SwapType::Out, SwapRole::Receiver) | (SwapType::In, SwapRole::Sender)
        )
    }

    /// Returns the swap's public key, generating the key pair on first use.
    pub fn local_pubkey(&mut self) -> anyhow::Result<PublicKey> {
        let secp = Secp256k1::new();
        if let Some(privkey_hex) = &self.privkey_hex {
            let bytes =
                hex::decode(privkey_hex).map_err(|e| anyhow::anyhow!("decode privkey: {e}"))?;
            let secret_key = SecretKey::from_slice(&bytes)
                .map_err(|e| anyhow::anyhow!("parse privkey: {e}"))?;
            return Ok(secret_key.public_key(&secp));
        }

        let (secret_key, public_key) =
            secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        self.privkey_hex = Some(hex::encode(secret_key.secret_bytes()));
        Ok(public_key)
    }

    pub fn opening_params(&self) -> Result<OpeningParams, SwapError> {
        fn required(field: &Option<String>, name: &'static str) -> Result<String, SwapError> {
            field.clone().ok_or(SwapError::MissingField(name))
        }

        Ok(OpeningParams {
            asset: self.asset,
            amount: self.amount,
            maker_pubkey_hash: required(&self.maker_pubkey_hash, "maker_pubkey_hash")?,
            taker_pubkey_hash: required(&self.taker_pubkey_hash, "taker_pubkey_hash")?,
            claim_payment_hash: required(&self.claim_payment_hash, "claim_payment_hash")?,
            cltv: self.cltv.ok_or(SwapError::MissingField("cltv"))?,
        })
    }

    pub fn fee_label(&self) -> String {
        format!("fee_{}", self.id)
    }

    pub fn claim_label(&self) -> String {
        format!("claim_{}", self.id)
    }

    pub fn record_error(&mut self, kind: ErrorKind, err: impl fmt::Display) {
        let message = err.to_string();
        tracing::warn!(swap_id = %self.id, ?kind, error = %message, "swap action failed");
        self.last_err_string = Some(message.clone());
        self.last_err = Some(ErrorRecord {
            kind,
            message,
            occurred_at: unix_now(),
        });
    }

    /// Records the error on the swap and yields the failure event.
    pub fn handle_error(&mut self, kind: ErrorKind, err: impl fmt::Display) -> EventType {
        self.record_error(kind, err);
        EventType::ActionFailed
    }
}

pub fn pubkey_hash(pubkey: &PublicKey) -> String {
    hex::encode(hash160::Hash::hash(&pubkey.serialize()).to_byte_array())
}

pub fn new_swap_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Caller-supplied parameters of a new swap.
#[derive(Debug, Clone)]
pub struct SwapCreationContext {
    pub swap_id: String,
    pub asset: Asset,
    pub amount: u64,
    pub peer: String,
    pub channel_id: String,
    pub initiator_id: String,
    pub protocol_version: u64,
}

impl SwapCreationContext {
    pub fn new_swap(&self, swap_type: SwapType, role: SwapRole) -> SwapData {
        SwapData {
            id: self.swap_id.clone(),
            swap_type,
            role,
            protocol_version: self.protocol_version,
            created_at: unix_now(),
            initiator_node_id: self.initiator_id.clone(),
            peer_node_id: self.peer.clone(),
            channel_id: self.channel_id.clone(),
            asset: self.asset,
            amount: self.amount,
            privkey_hex: None,
            maker_pubkey_hash: None,
            taker_pubkey_hash: None,
            cltv: None,
            fee_invoice: None,
            fee_preimage: None,
            claim_invoice: None,
            claim_payment_hash: None,
            claim_preimage: None,
            opening_tx_id: None,
            opening_tx_unprepared_hex: None,
            opening_tx_hex: None,
            opening_tx_vout: None,
            opening_tx_fee: None,
            claim_tx_id: None,
            cancel_message: None,
            next_message: None,
            last_err: None,
            last_err_string: None,
        }
    }
}
