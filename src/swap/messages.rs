use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SwapError;
use super::fsm::EventType;
use super::{Asset, SwapData};

/// Peer message kinds; the numeric code travels out of band next to the JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    SwapInRequest,
    SwapOutRequest,
    SwapInAgreement,
    FeeResponse,
    TxOpenedResponse,
    Canceled,
    Claimed,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::SwapInRequest,
        MessageType::SwapOutRequest,
        MessageType::SwapInAgreement,
        MessageType::FeeResponse,
        MessageType::TxOpenedResponse,
        MessageType::Canceled,
        MessageType::Claimed,
    ];

    pub fn code(&self) -> u16 {
        match self {
            MessageType::SwapInRequest => 0xa455,
            MessageType::SwapOutRequest => 0xa457,
            MessageType::SwapInAgreement => 0xa459,
            MessageType::FeeResponse => 0xa461,
            MessageType::TxOpenedResponse => 0xa463,
            MessageType::Canceled => 0xa465,
            MessageType::Claimed => 0xa467,
        }
    }

    pub fn to_hex(&self) -> String {
        format!("{:04x}", self.code())
    }

    pub fn from_hex(s: &str) -> Result<Self, SwapError> {
        let code = u16::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| SwapError::UnknownMessageType(s.to_string()))?;
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| SwapError::UnknownMessageType(s.to_string()))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::SwapInRequest => "swap_in_request",
            MessageType::SwapOutRequest => "swap_out_request",
            MessageType::SwapInAgreement => "swap_in_agreement",
            MessageType::FeeResponse => "fee_response",
            MessageType::TxOpenedResponse => "tx_opened_response",
            MessageType::Canceled => "canceled",
            MessageType::Claimed => "claimed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOutRequest {
    pub swap_id: String,
    pub channel_id: String,
    pub amount: u64,
    pub taker_pubkey_hash: String,
    pub protocol_version: u64,
    pub asset: Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInRequest {
    pub swap_id: String,
    pub channel_id: String,
    pub amount: u64,
    pub protocol_version: u64,
    pub asset: Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInAgreement {
    pub swap_id: String,
    pub taker_pubkey_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeResponse {
    pub swap_id: String,
    pub invoice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOpenedResponse {
    pub swap_id: String,
    pub maker_pubkey_hash: String,
    pub invoice: String,
    pub tx_id: String,
    pub tx_vout: u32,
    pub cltv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canceled {
    pub swap_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Preimage,
    Cltv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimed {
    pub swap_id: String,
    pub claim_type: ClaimType,
    pub claim_tx_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PeerMessage {
    SwapOutRequest(SwapOutRequest),
    SwapInRequest(SwapInRequest),
    SwapInAgreement(SwapInAgreement),
    FeeResponse(FeeResponse),
    TxOpenedResponse(TxOpenedResponse),
    Canceled(Canceled),
    Claimed(Claimed),
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::SwapOutRequest(_) => MessageType::SwapOutRequest,
            PeerMessage::SwapInRequest(_) => MessageType::SwapInRequest,
            PeerMessage::SwapInAgreement(_) => MessageType::SwapInAgreement,
            PeerMessage::FeeResponse(_) => MessageType::FeeResponse,
            PeerMessage::TxOpenedResponse(_) => MessageType::TxOpenedResponse,
            PeerMessage::Canceled(_) => MessageType::Canceled,
            PeerMessage::Claimed(_) => MessageType::Claimed,
        }
    }

    pub fn swap_id(&self) -> &str {
        match self {
            PeerMessage::SwapOutRequest(m) => &m.swap_id,
            PeerMessage::SwapInRequest(m) => &m.swap_id,
            PeerMessage::SwapInAgreement(m) => &m.swap_id,
            PeerMessage::FeeResponse(m) => &m.swap_id,
            PeerMessage::TxOpenedResponse(m) => &m.swap_id,
            PeerMessage::Canceled(m) => &m.swap_id,
            PeerMessage::Claimed(m) => &m.swap_id,
        }
    }

    /// The FSM event raised by receiving this message.
    pub fn event(&self) -> EventType {
        match self {
            PeerMessage::SwapOutRequest(_) => EventType::OnSwapOutRequestReceived,
            PeerMessage::SwapInRequest(_) => EventType::OnSwapInRequestReceived,
            PeerMessage::SwapInAgreement(_) => EventType::OnSwapInAgreementReceived,
            PeerMessage::FeeResponse(_) => EventType::OnFeeInvoiceReceived,
            PeerMessage::TxOpenedResponse(_) => EventType::OnTxOpenedMessage,
            PeerMessage::Canceled(_) => EventType::OnCancelReceived,
            PeerMessage::Claimed(m) => match m.claim_type {
                ClaimType::Preimage => EventType::OnClaimedPreimage,
                ClaimType::Cltv => EventType::OnClaimedCltv,
            },
        }
    }

    /// Copies the counterparty-provided fields onto the receiving swap.
    pub fn apply_on_swap(&self, swap: &mut SwapData) {
        match self {
            PeerMessage::SwapOutRequest(m) => {
                swap.taker_pubkey_hash = Some(m.taker_pubkey_hash.clone());
            }
            PeerMessage::SwapInRequest(_) => {}
            PeerMessage::SwapInAgreement(m) => {
                swap.taker_pubkey_hash = Some(m.taker_pubkey_hash.clone());
            }
            PeerMessage::FeeResponse(m) => {
                swap.fee_invoice = Some(m.invoice.clone());
            }
            PeerMessage::TxOpenedResponse(m) => {
                swap.maker_pubkey_hash = Some(m.maker_pubkey_hash.clone());
                swap.claim_invoice = Some(m.invoice.clone());
                swap.opening_tx_id = Some(m.tx_id.clone());
                swap.opening_tx_vout = Some(m.tx_vout);
                swap.cltv = Some(m.cltv);
            }
            PeerMessage::Canceled(m) => {
                swap.cancel_message = Some(m.error.clone());
            }
            PeerMessage::Claimed(m) => {
                swap.claim_tx_id = Some(m.claim_tx_id.clone());
            }
        }
    }

    pub fn encode(&self) -> Result<(String, Vec<u8>), SwapError> {
        let payload = match self {
            PeerMessage::SwapOutRequest(m) => serde_json::to_vec(m)?,
            PeerMessage::SwapInRequest(m) => serde_json::to_vec(m)?,
            PeerMessage::SwapInAgreement(m) => serde_json::to_vec(m)?,
            PeerMessage::FeeResponse(m) => serde_json::to_vec(m)?,
            PeerMessage::TxOpenedResponse(m) => serde_json::to_vec(m)?,
            PeerMessage::Canceled(m) => serde_json::to_vec(m)?,
            PeerMessage::Claimed(m) => serde_json::to_vec(m)?,
        };
        Ok((self.message_type().to_hex(), payload))
    }

    pub fn decode(msg_type: &str, payload: &[u8]) -> Result<Self, SwapError> {
        Ok(match MessageType::from_hex(msg_type)? {
            MessageType::SwapOutRequest => {
                PeerMessage::SwapOutRequest(serde_json::from_slice(payload)?)
            }
            MessageType::SwapInRequest => {
                PeerMessage::SwapInRequest(serde_json::from_slice(payload)?)
            }
            MessageType::SwapInAgreement => {
                PeerMessage::SwapInAgreement(serde_json::from_slice(payload)?)
            }
            MessageType::FeeResponse => PeerMessage::FeeResponse(serde_json::from_slice(payload)?),
            MessageType::TxOpenedResponse => {
                PeerMessage::TxOpenedResponse(serde_json::from_slice(payload)?)
            }
            MessageType::Canceled => PeerMessage::Canceled(serde_json::from_slice(payload)?),
            MessageType::Claimed => PeerMessage::Claimed(serde_json::from_slice(payload)?),
        })
    }
}
