use std::sync::LazyLock;

use super::actions::Action;
use super::fsm::{EventType as E, State, StateType as S, States};
use super::{SwapRole, SwapType};

static SWAP_OUT_SENDER: LazyLock<States> = LazyLock::new(swap_out_sender_states);
static SWAP_OUT_RECEIVER: LazyLock<States> = LazyLock::new(swap_out_receiver_states);
static SWAP_IN_SENDER: LazyLock<States> = LazyLock::new(swap_in_sender_states);
static SWAP_IN_RECEIVER: LazyLock<States> = LazyLock::new(swap_in_receiver_states);

pub fn for_swap(swap_type: SwapType, role: SwapRole) -> &'static States {
    match (swap_type, role) {
        (SwapType::Out, SwapRole::Sender) => LazyLock::force(&SWAP_OUT_SENDER),
        (SwapType::Out, SwapRole::Receiver) => LazyLock::force(&SWAP_OUT_RECEIVER),
        (SwapType::In, SwapRole::Sender) => LazyLock::force(&SWAP_IN_SENDER),
        (SwapType::In, SwapRole::Receiver) => LazyLock::force(&SWAP_IN_RECEIVER),
    }
}

fn state<const N: usize>(action: Option<Action>, events: [(E, S); N]) -> State {
    State {
        action,
        events: events.into_iter().collect(),
    }
}

fn with_shared_states(mut states: States) -> States {
    states.insert(
        S::SendCancel,
        state(
            Some(Action::SendCancel),
            [
                (E::ActionSucceeded, S::SwapCanceled),
                (E::ActionFailed, S::SwapCanceled),
            ],
        ),
    );
    states.insert(S::SwapCanceled, state(Some(Action::Cancel), []));
    states.insert(S::ClaimedPreimage, state(Some(Action::NoOpDone), []));
    states.insert(S::ClaimedCltv, state(Some(Action::NoOpDone), []));
    states
}

/// Taker side of a swap-out: pays the fee and the claim invoice, claims on chain.
fn swap_out_sender_states() -> States {
    with_shared_states(States::from([
        (
            S::Default,
            state(None, [(E::OnSwapOutStarted, S::SwapOutSenderCreateSwap)]),
        ),
        (
            S::SwapOutSenderCreateSwap,
            state(
                Some(Action::CreateSwapOut),
                [
                    (E::ActionSucceeded, S::SwapOutSenderSendRequest),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapOutSenderSendRequest,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapOutSenderAwaitFeeResponse),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapOutSenderAwaitFeeResponse,
            state(
                Some(Action::NoOp),
                [
                    (E::OnFeeInvoiceReceived, S::SwapOutSenderPayFeeInvoice),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapOutSenderPayFeeInvoice,
            state(
                Some(Action::PayFeeInvoice),
                [
                    (E::ActionSucceeded, S::SwapOutSenderAwaitTxBroadcastedMessage),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapOutSenderAwaitTxBroadcastedMessage,
            state(
                Some(Action::NoOp),
                [
                    (E::OnTxOpenedMessage, S::SwapOutSenderAwaitTxConfirmation),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        // From here on the fee is paid and the opening tx exists: no cancel, only
        // the cooperative claim or the maker's timeout claim.
        (
            S::SwapOutSenderAwaitTxConfirmation,
            state(
                Some(Action::AwaitTxConfirmation),
                [
                    (E::OnTxConfirmed, S::SwapOutSenderValidateTxAndPayClaimInvoice),
                    (E::ActionFailed, S::SwapOutSenderSendCancelAwaitCltv),
                    (E::OnCancelReceived, S::SwapOutSenderAwaitCltv),
                ],
            ),
        ),
        (
            S::SwapOutSenderValidateTxAndPayClaimInvoice,
            state(
                Some(Action::ValidateTxAndPayClaimInvoice),
                [
                    (E::ActionSucceeded, S::SwapOutSenderClaimSwap),
                    (E::ActionFailed, S::SwapOutSenderSendCancelAwaitCltv),
                ],
            ),
        ),
        (
            S::SwapOutSenderClaimSwap,
            state(
                Some(Action::ClaimSwapTransactionWithPreimage),
                [
                    (E::ActionSucceeded, S::SwapOutSenderSendClaimMessage),
                    (E::OnRetry, S::SwapOutSenderClaimSwap),
                ],
            ),
        ),
        (
            S::SwapOutSenderSendClaimMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::ClaimedPreimage),
                    (E::ActionFailed, S::ClaimedPreimage),
                ],
            ),
        ),
        (
            S::SwapOutSenderSendCancelAwaitCltv,
            state(
                Some(Action::SendCancel),
                [
                    (E::ActionSucceeded, S::SwapOutSenderAwaitCltv),
                    (E::ActionFailed, S::SwapOutSenderAwaitCltv),
                ],
            ),
        ),
        (
            S::SwapOutSenderAwaitCltv,
            state(
                Some(Action::NoOp),
                [(E::OnClaimedCltv, S::ClaimedCltv)],
            ),
        ),
    ]))
}

/// Maker side of a swap-out: charges the fee, funds the opening tx, gets paid
/// the claim invoice or reclaims after the CLTV.
fn swap_out_receiver_states() -> States {
    with_shared_states(States::from([
        (
            S::Default,
            state(
                None,
                [(E::OnSwapOutRequestReceived, S::SwapOutReceiverCreateSwap)],
            ),
        ),
        (
            S::SwapOutReceiverCreateSwap,
            state(
                Some(Action::CreateSwapOutFromRequest),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverCreateFeeInvoice),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapOutReceiverCreateFeeInvoice,
            state(
                Some(Action::CreateFeeInvoice),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverSendFeeInvoice),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapOutReceiverSendFeeInvoice,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverFeeInvoiceSent),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapOutReceiverFeeInvoiceSent,
            state(
                Some(Action::NoOp),
                [
                    (E::OnFeeInvoicePaid, S::SwapOutReceiverBroadcastOpeningTx),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapOutReceiverBroadcastOpeningTx,
            state(
                Some(Action::CreateAndBroadcastOpeningTx),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverSendTxBroadcastedMessage),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapOutReceiverSendTxBroadcastedMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverTxMsgSent),
                    (E::ActionFailed, S::SwapOutReceiverSwapAborted),
                ],
            ),
        ),
        (
            S::SwapOutReceiverTxMsgSent,
            state(
                Some(Action::AwaitCltv),
                [
                    (E::OnClaimInvoicePaid, S::ClaimedPreimage),
                    (E::OnClaimedPreimage, S::ClaimedPreimage),
                    (E::OnCancelReceived, S::SwapOutReceiverSwapAborted),
                    (E::OnCltvPassed, S::SwapOutReceiverClaimSwapCltv),
                    (E::ActionFailed, S::SwapOutReceiverSwapAborted),
                ],
            ),
        ),
        (
            S::SwapOutReceiverSwapAborted,
            state(
                Some(Action::AwaitCltv),
                [
                    (E::OnCltvPassed, S::SwapOutReceiverClaimSwapCltv),
                    (E::OnClaimInvoicePaid, S::ClaimedPreimage),
                ],
            ),
        ),
        (
            S::SwapOutReceiverClaimSwapCltv,
            state(
                Some(Action::ClaimSwapTransactionWithCltv),
                [
                    (E::ActionSucceeded, S::SwapOutReceiverSendClaimMessage),
                    (E::OnRetry, S::SwapOutReceiverClaimSwapCltv),
                ],
            ),
        ),
        (
            S::SwapOutReceiverSendClaimMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::ClaimedCltv),
                    (E::ActionFailed, S::ClaimedCltv),
                ],
            ),
        ),
    ]))
}

/// Maker side of a swap-in: funds the opening tx and gets paid the claim invoice.
fn swap_in_sender_states() -> States {
    with_shared_states(States::from([
        (
            S::Default,
            state(None, [(E::OnSwapInStarted, S::SwapInSenderCreateSwap)]),
        ),
        (
            S::SwapInSenderCreateSwap,
            state(
                Some(Action::CreateSwapIn),
                [
                    (E::ActionSucceeded, S::SwapInSenderSendRequest),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInSenderSendRequest,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapInSenderAwaitAgreement),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInSenderAwaitAgreement,
            state(
                Some(Action::NoOp),
                [
                    (E::OnSwapInAgreementReceived, S::SwapInSenderBroadcastOpeningTx),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInSenderBroadcastOpeningTx,
            state(
                Some(Action::CreateAndBroadcastOpeningTx),
                [
                    (E::ActionSucceeded, S::SwapInSenderSendTxBroadcastedMessage),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapInSenderSendTxBroadcastedMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapInSenderAwaitClaimPayment),
                    (E::ActionFailed, S::SwapInSenderSwapAborted),
                ],
            ),
        ),
        (
            S::SwapInSenderAwaitClaimPayment,
            state(
                Some(Action::AwaitCltv),
                [
                    (E::OnClaimInvoicePaid, S::ClaimedPreimage),
                    (E::OnClaimedPreimage, S::ClaimedPreimage),
                    (E::OnCancelReceived, S::SwapInSenderSwapAborted),
                    (E::OnCltvPassed, S::SwapInSenderClaimSwapCltv),
                    (E::ActionFailed, S::SwapInSenderSwapAborted),
                ],
            ),
        ),
        (
            S::SwapInSenderSwapAborted,
            state(
                Some(Action::AwaitCltv),
                [
                    (E::OnCltvPassed, S::SwapInSenderClaimSwapCltv),
                    (E::OnClaimInvoicePaid, S::ClaimedPreimage),
                ],
            ),
        ),
        (
            S::SwapInSenderClaimSwapCltv,
            state(
                Some(Action::ClaimSwapTransactionWithCltv),
                [
                    (E::ActionSucceeded, S::SwapInSenderSendClaimMessage),
                    (E::OnRetry, S::SwapInSenderClaimSwapCltv),
                ],
            ),
        ),
        (
            S::SwapInSenderSendClaimMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::ClaimedCltv),
                    (E::ActionFailed, S::ClaimedCltv),
                ],
            ),
        ),
    ]))
}

/// Taker side of a swap-in: pays the claim invoice and claims on chain. Nothing
/// is committed before the payment, so every failure cancels.
fn swap_in_receiver_states() -> States {
    with_shared_states(States::from([
        (
            S::Default,
            state(
                None,
                [(E::OnSwapInRequestReceived, S::SwapInReceiverCreateSwap)],
            ),
        ),
        (
            S::SwapInReceiverCreateSwap,
            state(
                Some(Action::CreateSwapInFromRequest),
                [
                    (E::ActionSucceeded, S::SwapInReceiverSendAgreement),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapInReceiverSendAgreement,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::SwapInReceiverAwaitTxOpenedMessage),
                    (E::ActionFailed, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInReceiverAwaitTxOpenedMessage,
            state(
                Some(Action::NoOp),
                [
                    (E::OnTxOpenedMessage, S::SwapInReceiverAwaitTxConfirmation),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInReceiverAwaitTxConfirmation,
            state(
                Some(Action::AwaitTxConfirmation),
                [
                    (E::OnTxConfirmed, S::SwapInReceiverValidateTxAndPayClaimInvoice),
                    (E::ActionFailed, S::SendCancel),
                    (E::OnCancelReceived, S::SwapCanceled),
                ],
            ),
        ),
        (
            S::SwapInReceiverValidateTxAndPayClaimInvoice,
            state(
                Some(Action::ValidateTxAndPayClaimInvoice),
                [
                    (E::ActionSucceeded, S::SwapInReceiverClaimSwap),
                    (E::ActionFailed, S::SendCancel),
                ],
            ),
        ),
        (
            S::SwapInReceiverClaimSwap,
            state(
                Some(Action::ClaimSwapTransactionWithPreimage),
                [
                    (E::ActionSucceeded, S::SwapInReceiverSendClaimMessage),
                    (E::OnRetry, S::SwapInReceiverClaimSwap),
                ],
            ),
        ),
        (
            S::SwapInReceiverSendClaimMessage,
            state(
                Some(Action::SendMessage),
                [
                    (E::ActionSucceeded, S::ClaimedPreimage),
                    (E::ActionFailed, S::ClaimedPreimage),
                ],
            ),
        ),
    ]))
}
