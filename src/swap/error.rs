use thiserror::Error;

use super::fsm::{EventType, StateType};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("already has an active swap on channel")]
    ActiveSwapOnChannel,

    #[error("swap already exists: {0}")]
    SwapExists(String),

    #[error("swap not found: {0}")]
    SwapNotFound(String),

    #[error("unhandled event {event} in state {state}")]
    UnhandledEvent { state: StateType, event: EventType },

    #[error("state {0} is missing from the state table")]
    UnknownState(StateType),

    #[error("nothing to send")]
    NothingToSend,

    #[error("missing swap field: {0}")]
    MissingField(&'static str),

    #[error("invoice amount does not equal swap amount: invoice_msat={invoice_msat} swap_msat={swap_msat}")]
    InvoiceAmountMismatch { invoice_msat: u64, swap_msat: u64 },

    #[error("opening transaction {0} failed validation")]
    InvalidOpeningTx(String),

    #[error("unsupported asset: {0}")]
    UnsupportedAsset(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("peer {peer_id} does not own swap {swap_id}")]
    PeerMismatch { swap_id: String, peer_id: String },

    #[error("invalid payment label: {0}")]
    InvalidPaymentLabel(String),

    #[error("rejected by policy")]
    RejectedByPolicy,

    #[error("decode message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("swap store: {0:#}")]
    Store(anyhow::Error),
}
