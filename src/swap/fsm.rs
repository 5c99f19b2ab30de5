use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::actions::Action;
use super::error::SwapError;
use super::messages::PeerMessage;
use super::services::SwapServices;
use super::states;
use super::{ErrorKind, ErrorRecord, SwapData, SwapRole, SwapType, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    Default,

    SwapOutSenderCreateSwap,
    SwapOutSenderSendRequest,
    SwapOutSenderAwaitFeeResponse,
    SwapOutSenderPayFeeInvoice,
    SwapOutSenderAwaitTxBroadcastedMessage,
    SwapOutSenderAwaitTxConfirmation,
    SwapOutSenderValidateTxAndPayClaimInvoice,
    SwapOutSenderClaimSwap,
    SwapOutSenderSendClaimMessage,
    SwapOutSenderSendCancelAwaitCltv,
    SwapOutSenderAwaitCltv,

    SwapOutReceiverCreateSwap,
    SwapOutReceiverCreateFeeInvoice,
    SwapOutReceiverSendFeeInvoice,
    SwapOutReceiverFeeInvoiceSent,
    SwapOutReceiverBroadcastOpeningTx,
    SwapOutReceiverSendTxBroadcastedMessage,
    SwapOutReceiverTxMsgSent,
    SwapOutReceiverSwapAborted,
    SwapOutReceiverClaimSwapCltv,
    SwapOutReceiverSendClaimMessage,

    SwapInSenderCreateSwap,
    SwapInSenderSendRequest,
    SwapInSenderAwaitAgreement,
    SwapInSenderBroadcastOpeningTx,
    SwapInSenderSendTxBroadcastedMessage,
    SwapInSenderAwaitClaimPayment,
    SwapInSenderSwapAborted,
    SwapInSenderClaimSwapCltv,
    SwapInSenderSendClaimMessage,

    SwapInReceiverCreateSwap,
    SwapInReceiverSendAgreement,
    SwapInReceiverAwaitTxOpenedMessage,
    SwapInReceiverAwaitTxConfirmation,
    SwapInReceiverValidateTxAndPayClaimInvoice,
    SwapInReceiverClaimSwap,
    SwapInReceiverSendClaimMessage,

    SendCancel,
    SwapCanceled,
    ClaimedPreimage,
    ClaimedCltv,
}

impl StateType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateType::SwapCanceled | StateType::ClaimedPreimage | StateType::ClaimedCltv
        )
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OnSwapOutStarted,
    OnSwapInStarted,
    OnSwapOutRequestReceived,
    OnSwapInRequestReceived,
    OnSwapInAgreementReceived,
    OnFeeInvoiceReceived,
    OnFeeInvoicePaid,
    OnTxOpenedMessage,
    OnTxConfirmed,
    OnClaimInvoicePaid,
    OnClaimedPreimage,
    OnClaimedCltv,
    OnCltvPassed,
    OnCancelReceived,
    OnRetry,

    ActionSucceeded,
    ActionFailed,
    /// Suspend until an external event arrives.
    NoOp,
    Done,
}

impl EventType {
    /// Late or replayed notifications that are dropped when the current state has
    /// no use for them.
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            EventType::OnFeeInvoicePaid
                | EventType::OnTxConfirmed
                | EventType::OnClaimInvoicePaid
                | EventType::OnClaimedPreimage
                | EventType::OnClaimedCltv
                | EventType::OnCltvPassed
                | EventType::OnCancelReceived
        )
    }

    /// Events produced by actions and the engine, never by the outside world.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EventType::OnRetry
                | EventType::ActionSucceeded
                | EventType::ActionFailed
                | EventType::NoOp
                | EventType::Done
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type Events = HashMap<EventType, StateType>;

enum Transition {
    Enter(StateType),
    Redelivered,
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub action: Option<Action>,
    pub events: Events,
}

pub type States = HashMap<StateType, State>;

/// A swap together with its position in the protocol. The state table is
/// resolved from `(swap_type, role)` and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapStateMachine {
    pub id: String,
    pub swap_type: SwapType,
    pub role: SwapRole,
    pub previous: StateType,
    pub current: StateType,
    pub data: SwapData,
    pub retries: u32,
    pub failures: u32,
}

impl SwapStateMachine {
    pub fn new(data: SwapData) -> Self {
        Self {
            id: data.id.clone(),
            swap_type: data.swap_type,
            role: data.role,
            previous: StateType::Default,
            current: StateType::Default,
            data,
            retries: 0,
            failures: 0,
        }
    }

    pub fn states(&self) -> &'static States {
        states::for_swap(self.swap_type, self.role)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Applies `event` and runs the resulting action chain until the swap
    /// suspends or terminates. Returns `false` if an ignorable event was dropped.
    ///
    /// An event that leads into the current state from elsewhere in the table is
    /// a redelivery: the payload is not applied again and the current state's
    /// action runs once more with a fresh retry budget.
    pub async fn send_event(
        &mut self,
        services: &SwapServices,
        event: EventType,
        payload: Option<PeerMessage>,
    ) -> Result<bool, SwapError> {
        match self.next_state(event)? {
            Transition::Enter(next) => {
                if let Some(message) = &payload {
                    message.apply_on_swap(&mut self.data);
                }
                self.drive(services, Some(next)).await
            }
            Transition::Redelivered => {
                tracing::info!(
                    swap_id = %self.id,
                    state = %self.current,
                    %event,
                    "re-running state on redelivered event"
                );
                self.retries = 0;
                self.drive(services, None).await
            }
            Transition::Drop => {
                tracing::debug!(
                    swap_id = %self.id,
                    state = %self.current,
                    %event,
                    "dropping ignorable event"
                );
                Ok(false)
            }
        }
    }

    /// Re-runs the action of the current state, for swaps left parked or
    /// interrupted mid-action. Returns `false` for swaps with nothing to resume.
    pub async fn resume(&mut self, services: &SwapServices) -> Result<bool, SwapError> {
        if self.is_terminal() || self.current == StateType::Default {
            return Ok(false);
        }
        tracing::info!(swap_id = %self.id, state = %self.current, "resuming swap");
        self.retries = 0;
        self.drive(services, None).await
    }

    /// The action loop. With `next == None` the current state is run as is.
    async fn drive(
        &mut self,
        services: &SwapServices,
        mut next: Option<StateType>,
    ) -> Result<bool, SwapError> {
        loop {
            if let Some(next) = next {
                self.enter(next);
            }
            self.persist(services)?;

            let state = self
                .states()
                .get(&self.current)
                .ok_or(SwapError::UnknownState(self.current))?;
            let Some(action) = state.action else {
                return Ok(true);
            };

            let mut event = action.execute(services, &mut self.data).await;
            if event == EventType::OnRetry {
                if self.retries >= services.config.max_action_retries {
                    event = self.data.handle_error(
                        ErrorKind::Infrastructure,
                        format!("giving up after {} retries", self.retries),
                    );
                } else {
                    tokio::time::sleep(services.config.retry_backoff()).await;
                }
            }
            if event == EventType::ActionFailed {
                self.failures += 1;
            }
            self.persist(services)?;

            match event {
                EventType::NoOp => {
                    tracing::debug!(swap_id = %self.id, state = %self.current, "swap suspended");
                    return Ok(true);
                }
                EventType::Done => {
                    tracing::info!(swap_id = %self.id, state = %self.current, "swap finished");
                    return Ok(true);
                }
                _ => {}
            }

            next = match self.states()[&self.current].events.get(&event) {
                Some(next) => Some(*next),
                None => return Err(self.park(services, event)),
            };
        }
    }

    fn next_state(&self, event: EventType) -> Result<Transition, SwapError> {
        let states = self.states();
        let state = states
            .get(&self.current)
            .ok_or(SwapError::UnknownState(self.current))?;
        if let Some(next) = state.events.get(&event) {
            return Ok(Transition::Enter(*next));
        }
        if !self.is_terminal()
            && !event.is_internal()
            && states
                .values()
                .any(|other| other.events.get(&event) == Some(&self.current))
        {
            return Ok(Transition::Redelivered);
        }
        if event.is_ignorable() {
            return Ok(Transition::Drop);
        }
        Err(SwapError::UnhandledEvent {
            state: self.current,
            event,
        })
    }

    fn enter(&mut self, next: StateType) {
        if next == self.current {
            self.retries += 1;
        } else {
            self.retries = 0;
        }
        self.previous = self.current;
        self.current = next;
        tracing::info!(
            swap_id = %self.id,
            from = %self.previous,
            to = %self.current,
            "swap transition"
        );
    }

    /// Leaves the swap in its current state with the error recorded.
    fn park(&mut self, services: &SwapServices, event: EventType) -> SwapError {
        let err = SwapError::UnhandledEvent {
            state: self.current,
            event,
        };
        tracing::error!(swap_id = %self.id, error = %err, "swap parked");
        self.data.last_err_string = Some(err.to_string());
        self.data.last_err = Some(ErrorRecord {
            kind: ErrorKind::Unhandled,
            message: err.to_string(),
            occurred_at: unix_now(),
        });
        match self.persist(services) {
            Ok(()) => err,
            Err(store_err) => store_err,
        }
    }

    fn persist(&self, services: &SwapServices) -> Result<(), SwapError> {
        services.store.put(self).map_err(SwapError::Store)
    }
}
