use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::error::SwapError;
use super::fsm::{EventType, StateType, SwapStateMachine};
use super::messages::{Canceled, PeerMessage};
use super::services::SwapServices;
use super::{Asset, SwapCreationContext, SwapRole, SwapType, new_swap_id};

pub type SharedSwap = Arc<tokio::sync::Mutex<SwapStateMachine>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapServiceConfig {
    pub protocol_version: u64,
    pub bitcoin_cltv_delta: u32,
    pub liquid_cltv_delta: u32,
    pub invoice_expiry_secs: u32,
    pub max_action_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SwapServiceConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            bitcoin_cltv_delta: 1008,
            liquid_cltv_delta: 60,
            invoice_expiry_secs: 3600,
            max_action_retries: 5,
            retry_backoff_ms: 500,
        }
    }
}

impl SwapServiceConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read swap config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse swap config {}", path.display()))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Asynchronous input to the service, pushed by the transport and the
/// lightning/chain watchers.
#[derive(Debug, Clone)]
pub enum SwapNotification {
    Message {
        peer_id: String,
        msg_type: String,
        payload: Vec<u8>,
    },
    PaymentReceived {
        label: String,
    },
    TxConfirmed {
        swap_id: String,
    },
    CltvPassed {
        swap_id: String,
    },
}

#[derive(Default)]
struct Registry {
    swaps: HashMap<String, SharedSwap>,
    /// channel id -> id of the swap in flight on it
    active_channels: HashMap<String, String>,
}

pub struct SwapService {
    services: SwapServices,
    registry: Mutex<Registry>,
}

impl SwapService {
    pub fn new(services: SwapServices) -> Self {
        Self {
            services,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn services(&self) -> &SwapServices {
        &self.services
    }

    /// Reloads every stored swap. Finished swaps come back as history and free
    /// their channel; unfinished ones claim it again. Nothing is replayed: a
    /// recovered swap moves on its next message or callback, or on `resume`.
    /// Returns the number of unfinished swaps.
    pub fn start(&self) -> Result<usize, SwapError> {
        let swaps = self.services.store.list_all().map_err(SwapError::Store)?;
        let mut recovered = 0;
        for swap in swaps {
            if swap.current == StateType::Default {
                continue;
            }
            if !swap.is_terminal() {
                tracing::info!(
                    swap_id = %swap.id,
                    swap_type = %swap.swap_type,
                    role = %swap.role,
                    state = %swap.current,
                    "recovered swap"
                );
                self.track_issued_invoices(&swap);
                recovered += 1;
            }
            self.add_active_swap(swap)?;
        }
        Ok(recovered)
    }

    /// A maker's invoices are only watched in memory; hand them back to the
    /// lightning backend so their payment still reaches the swap.
    fn track_issued_invoices(&self, swap: &SwapStateMachine) {
        if !swap.data.is_maker() {
            return;
        }
        let issued = [
            (swap.data.fee_label(), &swap.data.fee_invoice),
            (swap.data.claim_label(), &swap.data.claim_invoice),
        ];
        for (label, invoice) in issued {
            let Some(invoice) = invoice else {
                continue;
            };
            if let Err(err) = self.services.lightning.track_invoice(&label, invoice) {
                tracing::warn!(
                    swap_id = %swap.id,
                    %label,
                    error = %format!("{err:#}"),
                    "track recovered invoice"
                );
            }
        }
    }

    pub async fn swap_out(
        &self,
        peer_id: &str,
        asset: Asset,
        channel_id: &str,
        initiator_id: &str,
        amount: u64,
    ) -> Result<SharedSwap, SwapError> {
        self.start_swap(
            SwapType::Out,
            EventType::OnSwapOutStarted,
            peer_id,
            asset,
            channel_id,
            initiator_id,
            amount,
        )
        .await
    }

    pub async fn swap_in(
        &self,
        peer_id: &str,
        asset: Asset,
        channel_id: &str,
        initiator_id: &str,
        amount: u64,
    ) -> Result<SharedSwap, SwapError> {
        self.start_swap(
            SwapType::In,
            EventType::OnSwapInStarted,
            peer_id,
            asset,
            channel_id,
            initiator_id,
            amount,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_swap(
        &self,
        swap_type: SwapType,
        event: EventType,
        peer_id: &str,
        asset: Asset,
        channel_id: &str,
        initiator_id: &str,
        amount: u64,
    ) -> Result<SharedSwap, SwapError> {
        self.services.onchain(asset)?;

        let ctx = SwapCreationContext {
            swap_id: new_swap_id(),
            asset,
            amount,
            peer: peer_id.to_string(),
            channel_id: channel_id.to_string(),
            initiator_id: initiator_id.to_string(),
            protocol_version: self.services.config.protocol_version,
        };
        let swap = self.add_active_swap(SwapStateMachine::new(
            ctx.new_swap(swap_type, SwapRole::Sender),
        ))?;
        tracing::info!(
            swap_id = %ctx.swap_id,
            %swap_type,
            %asset,
            %channel_id,
            amount,
            "starting swap"
        );

        self.send_event(&swap, event, None).await?;
        Ok(swap)
    }

    /// Registers a swap. A non-terminal swap claims its channel.
    pub fn add_active_swap(&self, swap: SwapStateMachine) -> Result<SharedSwap, SwapError> {
        let mut registry = self.registry.lock().expect("swap registry mutex poisoned");
        if registry.swaps.contains_key(&swap.id) {
            return Err(SwapError::SwapExists(swap.id));
        }
        let active = !swap.is_terminal();
        if active && registry.active_channels.contains_key(&swap.data.channel_id) {
            return Err(SwapError::ActiveSwapOnChannel);
        }

        let swap_id = swap.id.clone();
        let channel_id = swap.data.channel_id.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(swap));
        registry.swaps.insert(swap_id.clone(), shared.clone());
        if active {
            registry.active_channels.insert(channel_id, swap_id);
        }
        Ok(shared)
    }

    pub fn get_active_swap(&self, swap_id: &str) -> Result<SharedSwap, SwapError> {
        self.registry
            .lock()
            .expect("swap registry mutex poisoned")
            .swaps
            .get(swap_id)
            .cloned()
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))
    }

    pub fn list_swaps(&self) -> Vec<SharedSwap> {
        self.registry
            .lock()
            .expect("swap registry mutex poisoned")
            .swaps
            .values()
            .cloned()
            .collect()
    }

    pub fn has_active_swap_on_channel(&self, channel_id: &str) -> bool {
        self.registry
            .lock()
            .expect("swap registry mutex poisoned")
            .active_channels
            .contains_key(channel_id)
    }

    fn release_channel(&self, channel_id: &str, swap_id: &str) {
        let mut registry = self.registry.lock().expect("swap registry mutex poisoned");
        if registry.active_channels.get(channel_id).map(String::as_str) == Some(swap_id) {
            registry.active_channels.remove(channel_id);
        }
    }

    /// Feeds one event into a swap while holding its execution lock.
    async fn send_event(
        &self,
        swap: &SharedSwap,
        event: EventType,
        payload: Option<PeerMessage>,
    ) -> Result<(), SwapError> {
        let mut machine = swap.lock().await;
        let result = machine.send_event(&self.services, event, payload).await;
        if machine.is_terminal() {
            self.release_channel(&machine.data.channel_id, &machine.id);
        }
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(
                    swap_id = %machine.id,
                    %event,
                    state = %machine.current,
                    "event ignored"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-runs the current action of a swap that was parked or interrupted.
    pub async fn resume(&self, swap_id: &str) -> Result<(), SwapError> {
        let swap = self.get_active_swap(swap_id)?;
        let mut machine = swap.lock().await;
        let result = machine.resume(&self.services).await;
        if machine.is_terminal() {
            self.release_channel(&machine.data.channel_id, &machine.id);
        }
        result.map(|_| ())
    }

    pub async fn on_message_received(
        &self,
        peer_id: &str,
        msg_type: &str,
        payload: &[u8],
    ) -> Result<(), SwapError> {
        let message = PeerMessage::decode(msg_type, payload)?;
        tracing::debug!(
            %peer_id,
            message_type = %message.message_type(),
            swap_id = %message.swap_id(),
            "received peer message"
        );

        match &message {
            PeerMessage::SwapOutRequest(req) => {
                let ctx = SwapCreationContext {
                    swap_id: req.swap_id.clone(),
                    asset: req.asset,
                    amount: req.amount,
                    peer: peer_id.to_string(),
                    channel_id: req.channel_id.clone(),
                    initiator_id: peer_id.to_string(),
                    protocol_version: req.protocol_version,
                };
                self.on_swap_request(SwapType::Out, ctx, message).await
            }
            PeerMessage::SwapInRequest(req) => {
                let ctx = SwapCreationContext {
                    swap_id: req.swap_id.clone(),
                    asset: req.asset,
                    amount: req.amount,
                    peer: peer_id.to_string(),
                    channel_id: req.channel_id.clone(),
                    initiator_id: peer_id.to_string(),
                    protocol_version: req.protocol_version,
                };
                self.on_swap_request(SwapType::In, ctx, message).await
            }
            _ => {
                let Ok(swap) = self.get_active_swap(message.swap_id()) else {
                    tracing::warn!(
                        %peer_id,
                        swap_id = %message.swap_id(),
                        message_type = %message.message_type(),
                        "dropping message for unknown swap"
                    );
                    return Ok(());
                };
                let owner = swap.lock().await.data.peer_node_id.clone();
                if owner != peer_id {
                    tracing::warn!(
                        %peer_id,
                        swap_id = %message.swap_id(),
                        "dropping message from foreign peer"
                    );
                    return Err(SwapError::PeerMismatch {
                        swap_id: message.swap_id().to_string(),
                        peer_id: peer_id.to_string(),
                    });
                }
                let event = message.event();
                self.send_event(&swap, event, Some(message)).await
            }
        }
    }

    async fn on_swap_request(
        &self,
        swap_type: SwapType,
        ctx: SwapCreationContext,
        message: PeerMessage,
    ) -> Result<(), SwapError> {
        if self.get_active_swap(&ctx.swap_id).is_ok() {
            tracing::warn!(
                swap_id = %ctx.swap_id,
                peer_id = %ctx.peer,
                "dropping duplicate swap request"
            );
            return Err(SwapError::SwapExists(ctx.swap_id));
        }

        let rejection = if self.services.onchain(ctx.asset).is_err() {
            Some(SwapError::UnsupportedAsset(ctx.asset.to_string()))
        } else if !self.services.policy.should_accept_swap(
            &ctx.peer,
            &ctx.channel_id,
            ctx.asset,
            ctx.amount,
        ) {
            Some(SwapError::RejectedByPolicy)
        } else {
            None
        };

        let registered = match rejection {
            Some(err) => Err(err),
            None => self.add_active_swap(SwapStateMachine::new(
                ctx.new_swap(swap_type, SwapRole::Receiver),
            )),
        };
        let swap = match registered {
            Ok(swap) => swap,
            Err(err) => {
                tracing::info!(
                    swap_id = %ctx.swap_id,
                    peer_id = %ctx.peer,
                    error = %err,
                    "rejecting swap request"
                );
                self.reply_cancel(&ctx.peer, &ctx.swap_id, &err).await;
                return Err(err);
            }
        };

        let event = message.event();
        self.send_event(&swap, event, Some(message)).await
    }

    /// Answers a request that never became a swap.
    async fn reply_cancel(&self, peer_id: &str, swap_id: &str, reason: &SwapError) {
        let message = PeerMessage::Canceled(Canceled {
            swap_id: swap_id.to_string(),
            error: reason.to_string(),
        });
        if let Err(err) = self.services.messenger.send_message(peer_id, &message).await {
            tracing::warn!(%peer_id, %swap_id, error = %err, "send cancel for rejected request");
        }
    }

    /// Routes a settled invoice by its `fee_<id>` / `claim_<id>` label.
    pub async fn on_payment_received(&self, label: &str) -> Result<(), SwapError> {
        let (event, swap_id) = match label.split_once('_') {
            Some(("fee", swap_id)) => (EventType::OnFeeInvoicePaid, swap_id),
            Some(("claim", swap_id)) => (EventType::OnClaimInvoicePaid, swap_id),
            _ => return Err(SwapError::InvalidPaymentLabel(label.to_string())),
        };
        self.on_callback(swap_id, event).await
    }

    pub async fn on_tx_confirmed(&self, swap_id: &str) -> Result<(), SwapError> {
        self.on_callback(swap_id, EventType::OnTxConfirmed).await
    }

    pub async fn on_cltv_passed(&self, swap_id: &str) -> Result<(), SwapError> {
        self.on_callback(swap_id, EventType::OnCltvPassed).await
    }

    async fn on_callback(&self, swap_id: &str, event: EventType) -> Result<(), SwapError> {
        let Ok(swap) = self.get_active_swap(swap_id) else {
            tracing::warn!(%swap_id, %event, "dropping callback for unknown swap");
            return Ok(());
        };
        self.send_event(&swap, event, None).await
    }

    pub async fn handle_notification(
        &self,
        notification: SwapNotification,
    ) -> Result<(), SwapError> {
        match notification {
            SwapNotification::Message {
                peer_id,
                msg_type,
                payload,
            } => self.on_message_received(&peer_id, &msg_type, &payload).await,
            SwapNotification::PaymentReceived { label } => self.on_payment_received(&label).await,
            SwapNotification::TxConfirmed { swap_id } => self.on_tx_confirmed(&swap_id).await,
            SwapNotification::CltvPassed { swap_id } => self.on_cltv_passed(&swap_id).await,
        }
    }

    /// Dispatches notifications in arrival order until every sender is dropped.
    pub async fn run(&self, mut notifications: mpsc::UnboundedReceiver<SwapNotification>) {
        while let Some(notification) = notifications.recv().await {
            if let Err(err) = self.handle_notification(notification).await {
                tracing::warn!(error = %err, "swap notification failed");
            }
        }
        tracing::info!("swap notification channel closed");
    }
}
