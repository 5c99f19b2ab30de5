use anyhow::Context as _;

use super::error::SwapError;
use super::fsm::EventType;
use super::messages::{
    Canceled, ClaimType, Claimed, FeeResponse, PeerMessage, SwapInAgreement, SwapInRequest,
    SwapOutRequest, TxOpenedResponse,
};
use super::services::SwapServices;
use super::{ErrorKind, SwapData, pubkey_hash};

/// Unit of work attached to a state. Every variant is safe to run again after a
/// crash: steps whose effect is already recorded on the swap are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateSwapOut,
    CreateSwapOutFromRequest,
    CreateSwapIn,
    CreateSwapInFromRequest,
    CreateFeeInvoice,
    SendMessage,
    PayFeeInvoice,
    AwaitTxConfirmation,
    ValidateTxAndPayClaimInvoice,
    CreateAndBroadcastOpeningTx,
    AwaitCltv,
    ClaimSwapTransactionWithPreimage,
    ClaimSwapTransactionWithCltv,
    SendCancel,
    Cancel,
    NoOp,
    NoOpDone,
}

enum ActionError {
    Protocol(SwapError),
    Infrastructure(anyhow::Error),
}

impl From<SwapError> for ActionError {
    fn from(err: SwapError) -> Self {
        ActionError::Protocol(err)
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::Infrastructure(err)
    }
}

type ActionResult = Result<EventType, ActionError>;

impl Action {
    pub async fn execute(self, services: &SwapServices, swap: &mut SwapData) -> EventType {
        let result = match self {
            Action::CreateSwapOut => create_swap_out(swap),
            Action::CreateSwapOutFromRequest => create_swap_out_from_request(swap),
            Action::CreateSwapIn => create_swap_in(swap),
            Action::CreateSwapInFromRequest => create_swap_in_from_request(swap),
            Action::CreateFeeInvoice => create_fee_invoice(services, swap).await,
            Action::SendMessage => send_message(services, swap).await,
            Action::PayFeeInvoice => pay_fee_invoice(services, swap).await,
            Action::AwaitTxConfirmation => await_tx_confirmation(services, swap).await,
            Action::ValidateTxAndPayClaimInvoice => {
                validate_tx_and_pay_claim_invoice(services, swap).await
            }
            Action::CreateAndBroadcastOpeningTx => {
                create_and_broadcast_opening_tx(services, swap).await
            }
            Action::AwaitCltv => await_cltv(services, swap).await,
            Action::ClaimSwapTransactionWithPreimage => claim_with_preimage(services, swap).await,
            Action::ClaimSwapTransactionWithCltv => claim_with_cltv(services, swap).await,
            Action::SendCancel => send_cancel(services, swap).await,
            Action::Cancel => {
                tracing::info!(
                    swap_id = %swap.id,
                    reason = swap.cancel_message.as_deref().unwrap_or_default(),
                    "swap canceled"
                );
                Ok(EventType::Done)
            }
            Action::NoOp => Ok(EventType::NoOp),
            Action::NoOpDone => Ok(EventType::Done),
        };

        match result {
            Ok(event) => event,
            Err(ActionError::Protocol(err)) => swap.handle_error(ErrorKind::Protocol, err),
            Err(ActionError::Infrastructure(err)) => {
                swap.handle_error(ErrorKind::Infrastructure, format!("{err:#}"))
            }
        }
    }
}

fn required<'a, T>(field: &'a Option<T>, name: &'static str) -> Result<&'a T, SwapError> {
    field.as_ref().ok_or(SwapError::MissingField(name))
}

fn create_swap_out(swap: &mut SwapData) -> ActionResult {
    let pubkey = swap.local_pubkey()?;
    let taker_pubkey_hash = pubkey_hash(&pubkey);
    swap.taker_pubkey_hash = Some(taker_pubkey_hash.clone());
    swap.next_message = Some(PeerMessage::SwapOutRequest(SwapOutRequest {
        swap_id: swap.id.clone(),
        channel_id: swap.channel_id.clone(),
        amount: swap.amount,
        taker_pubkey_hash,
        protocol_version: swap.protocol_version,
        asset: swap.asset,
    }));
    Ok(EventType::ActionSucceeded)
}

fn create_swap_out_from_request(swap: &mut SwapData) -> ActionResult {
    required(&swap.taker_pubkey_hash, "taker_pubkey_hash")?;
    let pubkey = swap.local_pubkey()?;
    swap.maker_pubkey_hash = Some(pubkey_hash(&pubkey));
    Ok(EventType::ActionSucceeded)
}

fn create_swap_in(swap: &mut SwapData) -> ActionResult {
    let pubkey = swap.local_pubkey()?;
    swap.maker_pubkey_hash = Some(pubkey_hash(&pubkey));
    swap.next_message = Some(PeerMessage::SwapInRequest(SwapInRequest {
        swap_id: swap.id.clone(),
        channel_id: swap.channel_id.clone(),
        amount: swap.amount,
        protocol_version: swap.protocol_version,
        asset: swap.asset,
    }));
    Ok(EventType::ActionSucceeded)
}

fn create_swap_in_from_request(swap: &mut SwapData) -> ActionResult {
    let pubkey = swap.local_pubkey()?;
    let taker_pubkey_hash = pubkey_hash(&pubkey);
    swap.taker_pubkey_hash = Some(taker_pubkey_hash.clone());
    swap.next_message = Some(PeerMessage::SwapInAgreement(SwapInAgreement {
        swap_id: swap.id.clone(),
        taker_pubkey_hash,
    }));
    Ok(EventType::ActionSucceeded)
}

async fn create_fee_invoice(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    if swap.fee_invoice.is_none() {
        let onchain = services.onchain(swap.asset)?;
        let fee_sat = onchain
            .opening_fee_estimate()
            .await
            .context("estimate opening fee")?;
        let invoice = services
            .lightning
            .create_invoice(
                fee_sat.saturating_mul(1000),
                &swap.fee_label(),
                services.config.invoice_expiry_secs,
            )
            .await
            .context("create fee invoice")?;
        swap.opening_tx_fee = Some(fee_sat);
        swap.fee_invoice = Some(invoice);
    }

    swap.next_message = Some(PeerMessage::FeeResponse(FeeResponse {
        swap_id: swap.id.clone(),
        invoice: required(&swap.fee_invoice, "fee_invoice")?.clone(),
    }));
    Ok(EventType::ActionSucceeded)
}

async fn send_message(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    let message = swap.next_message.as_ref().ok_or(SwapError::NothingToSend)?;
    services
        .messenger
        .send_message(&swap.peer_node_id, message)
        .await
        .with_context(|| format!("send {} to {}", message.message_type(), swap.peer_node_id))?;
    swap.next_message = None;
    Ok(EventType::ActionSucceeded)
}

async fn pay_fee_invoice(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    if swap.fee_preimage.is_some() {
        return Ok(EventType::ActionSucceeded);
    }

    let invoice = required(&swap.fee_invoice, "fee_invoice")?.clone();
    let decoded = services
        .lightning
        .decode_invoice(&invoice)
        .await
        .context("decode fee invoice")?;
    let fee_sat = decoded.amount_msat / 1000;
    swap.opening_tx_fee = Some(fee_sat);

    if !services
        .policy
        .should_pay_fee(swap.amount, fee_sat, &swap.peer_node_id, &swap.channel_id)
    {
        return Err(SwapError::RejectedByPolicy.into());
    }

    let preimage = services
        .lightning
        .pay_invoice(&invoice)
        .await
        .context("pay fee invoice")?;
    swap.fee_preimage = Some(preimage);
    Ok(EventType::ActionSucceeded)
}

async fn await_tx_confirmation(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    let onchain = services.onchain(swap.asset)?;
    let tx_id = required(&swap.opening_tx_id, "opening_tx_id")?;
    onchain
        .add_wait_for_confirmation(&swap.id, tx_id)
        .await
        .context("watch opening tx")?;
    Ok(EventType::NoOp)
}

async fn validate_tx_and_pay_claim_invoice(
    services: &SwapServices,
    swap: &mut SwapData,
) -> ActionResult {
    if swap.claim_preimage.is_some() {
        return Ok(EventType::ActionSucceeded);
    }

    let onchain = services.onchain(swap.asset)?;
    let invoice = required(&swap.claim_invoice, "claim_invoice")?.clone();
    let decoded = services
        .lightning
        .decode_invoice(&invoice)
        .await
        .context("decode claim invoice")?;

    let swap_msat = swap.amount.saturating_mul(1000);
    if decoded.amount_msat != swap_msat {
        return Err(SwapError::InvoiceAmountMismatch {
            invoice_msat: decoded.amount_msat,
            swap_msat,
        }
        .into());
    }
    swap.claim_payment_hash = Some(decoded.payment_hash);

    let params = swap.opening_params()?;
    let tx_id = required(&swap.opening_tx_id, "opening_tx_id")?.clone();
    let valid = onchain
        .validate_transaction(&params, &tx_id)
        .await
        .context("validate opening tx")?;
    if !valid {
        return Err(SwapError::InvalidOpeningTx(tx_id).into());
    }

    let preimage = services
        .lightning
        .rebalance(&invoice, &swap.channel_id)
        .await
        .context("pay claim invoice")?;
    swap.claim_preimage = Some(preimage);
    Ok(EventType::ActionSucceeded)
}

async fn create_and_broadcast_opening_tx(
    services: &SwapServices,
    swap: &mut SwapData,
) -> ActionResult {
    let onchain = services.onchain(swap.asset)?;

    if swap.opening_tx_id.is_none() {
        if swap.claim_invoice.is_none() {
            let invoice = services
                .lightning
                .create_invoice(
                    swap.amount.saturating_mul(1000),
                    &swap.claim_label(),
                    services.config.invoice_expiry_secs,
                )
                .await
                .context("create claim invoice")?;
            let decoded = services
                .lightning
                .decode_invoice(&invoice)
                .await
                .context("decode claim invoice")?;
            swap.claim_payment_hash = Some(decoded.payment_hash);
            swap.claim_invoice = Some(invoice);
        }

        let height = onchain.block_height().await.context("get block height")?;
        swap.cltv = Some(height.saturating_add(services.cltv_delta(swap.asset)));

        let params = swap.opening_params()?;
        let opening = onchain
            .create_opening_transaction(&params)
            .await
            .context("create opening tx")?;
        let broadcast = onchain
            .broadcast_opening_transaction(&opening.unprepared_hex)
            .await
            .context("broadcast opening tx")?;
        tracing::info!(swap_id = %swap.id, tx_id = %broadcast.tx_id, "opening tx broadcast");

        swap.opening_tx_unprepared_hex = Some(opening.unprepared_hex);
        swap.opening_tx_vout = Some(opening.vout);
        swap.opening_tx_fee = Some(opening.fee_sat);
        swap.opening_tx_hex = Some(broadcast.tx_hex);
        swap.opening_tx_id = Some(broadcast.tx_id);
    }

    swap.next_message = Some(PeerMessage::TxOpenedResponse(TxOpenedResponse {
        swap_id: swap.id.clone(),
        maker_pubkey_hash: required(&swap.maker_pubkey_hash, "maker_pubkey_hash")?.clone(),
        invoice: required(&swap.claim_invoice, "claim_invoice")?.clone(),
        tx_id: required(&swap.opening_tx_id, "opening_tx_id")?.clone(),
        tx_vout: *required(&swap.opening_tx_vout, "opening_tx_vout")?,
        cltv: *required(&swap.cltv, "cltv")?,
    }));
    Ok(EventType::ActionSucceeded)
}

async fn await_cltv(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    let onchain = services.onchain(swap.asset)?;
    let cltv = *required(&swap.cltv, "cltv")?;
    onchain
        .add_wait_for_cltv(&swap.id, cltv)
        .await
        .context("watch cltv")?;
    Ok(EventType::NoOp)
}

async fn claim_with_preimage(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    if swap.claim_tx_id.is_none() {
        let onchain = services.onchain(swap.asset)?;
        let params = swap.opening_params()?;
        let preimage = required(&swap.claim_preimage, "claim_preimage")?;
        let tx_id = required(&swap.opening_tx_id, "opening_tx_id")?;
        let vout = *required(&swap.opening_tx_vout, "opening_tx_vout")?;

        let claimed = onchain
            .claim_with_preimage(&params, preimage, tx_id, vout)
            .await;
        match claimed {
            Ok(claim_tx_id) => {
                tracing::info!(
                    swap_id = %swap.id,
                    %claim_tx_id,
                    "claimed opening tx with preimage"
                );
                swap.claim_tx_id = Some(claim_tx_id);
            }
            Err(err) => {
                swap.record_error(ErrorKind::Infrastructure, format!("{err:#}"));
                return Ok(EventType::OnRetry);
            }
        }
    }

    swap.next_message = Some(claimed_message(swap, ClaimType::Preimage)?);
    Ok(EventType::ActionSucceeded)
}

async fn claim_with_cltv(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    if swap.claim_tx_id.is_none() {
        let onchain = services.onchain(swap.asset)?;
        let params = swap.opening_params()?;
        let tx_id = required(&swap.opening_tx_id, "opening_tx_id")?;
        let vout = *required(&swap.opening_tx_vout, "opening_tx_vout")?;

        let claimed = onchain.claim_with_cltv(&params, tx_id, vout).await;
        match claimed {
            Ok(claim_tx_id) => {
                tracing::info!(swap_id = %swap.id, %claim_tx_id, "claimed opening tx after cltv");
                swap.claim_tx_id = Some(claim_tx_id);
            }
            Err(err) => {
                swap.record_error(ErrorKind::Infrastructure, format!("{err:#}"));
                return Ok(EventType::OnRetry);
            }
        }
    }

    swap.next_message = Some(claimed_message(swap, ClaimType::Cltv)?);
    Ok(EventType::ActionSucceeded)
}

fn claimed_message(swap: &SwapData, claim_type: ClaimType) -> Result<PeerMessage, SwapError> {
    Ok(PeerMessage::Claimed(Claimed {
        swap_id: swap.id.clone(),
        claim_type,
        claim_tx_id: required(&swap.claim_tx_id, "claim_tx_id")?.clone(),
    }))
}

async fn send_cancel(services: &SwapServices, swap: &mut SwapData) -> ActionResult {
    let reason = swap
        .last_err_string
        .clone()
        .unwrap_or_else(|| "swap canceled".to_string());
    swap.cancel_message = Some(reason.clone());
    swap.next_message = None;

    let message = PeerMessage::Canceled(Canceled {
        swap_id: swap.id.clone(),
        error: reason,
    });
    services
        .messenger
        .send_message(&swap.peer_node_id, &message)
        .await
        .context("send cancel")?;
    Ok(EventType::ActionSucceeded)
}
