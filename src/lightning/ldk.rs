use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11ReceiveRequest, Bolt11SendRequest, ListPaymentsRequest};
use ldk_server_protos::types::{
    Bolt11InvoiceDescription, Payment, PaymentDirection, PaymentStatus,
    bolt11_invoice_description, payment_kind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::invoice::{decode_bolt11, expiry_from_bolt11, payment_hash_from_bolt11};
use crate::swap::{DecodedInvoice, LightningClient, SwapNotification, unix_now};

#[derive(Debug, Clone)]
struct PendingInvoice {
    label: String,
    /// unix seconds
    expires_at: u64,
}

/// Lightning backend talking to an ldk-server REST endpoint.
#[derive(Clone)]
pub struct LdkLightningClient {
    client: LdkServerClient,
    payment_timeout: Duration,
    /// payment hash hex -> invoices we issued and have not seen settle
    pending: Arc<Mutex<HashMap<String, PendingInvoice>>>,
}

impl LdkLightningClient {
    pub fn new(rest_service_address: String) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
            payment_timeout: Duration::from_secs(60),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    async fn list_payments(&self) -> Result<Vec<Payment>> {
        Ok(self
            .client
            .list_payments(ListPaymentsRequest { page_token: None })
            .await
            .context("ListPayments")?
            .payments)
    }

    async fn send(&self, invoice: &str) -> Result<String> {
        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: invoice.to_string(),
                amount_msat: None,
                route_parameters: None,
            })
            .await
            .context("Bolt11Send")?;
        Ok(resp.payment_id)
    }

    pub async fn wait_preimage(&self, payment_id: &str, timeout: Duration) -> Result<[u8; 32]> {
        let deadline = Instant::now() + timeout;
        loop {
            let payments = self.list_payments().await?;

            if let Some(p) = payments.into_iter().find(|p| p.id == payment_id) {
                if p.direction == PaymentDirection::Outbound as i32
                    && p.status == PaymentStatus::Failed as i32
                {
                    anyhow::bail!("payment failed: payment_id={payment_id}");
                }
                if p.direction == PaymentDirection::Outbound as i32
                    && p.status == PaymentStatus::Succeeded as i32
                {
                    let preimage_hex = p
                        .kind
                        .and_then(|k| k.kind)
                        .and_then(|k| match k {
                            payment_kind::Kind::Bolt11(b) => b.preimage,
                            _ => None,
                        })
                        .context("missing payment preimage")?;

                    let bytes = hex::decode(preimage_hex).context("decode preimage hex")?;
                    let preimage: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
                    return Ok(preimage);
                }
            }

            if Instant::now() >= deadline {
                anyhow::bail!("timeout waiting for preimage: payment_id={payment_id}");
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Polls the node for settled inbound payments of invoices created through
    /// this client and reports each one once by its label.
    pub fn spawn_payment_watcher(
        &self,
        notifications: mpsc::UnboundedSender<SwapNotification>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if notifications.is_closed() {
                    return;
                }
                match this.list_payments().await {
                    Ok(payments) => {
                        for label in this.take_settled(&payments) {
                            tracing::info!(%label, "invoice paid");
                            if notifications
                                .send(SwapNotification::PaymentReceived { label })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %format!("{err:#}"), "poll payments"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    fn track(&self, label: &str, invoice: &str) -> Result<()> {
        // ldk-node keys inbound bolt11 payments by their payment hash.
        let payment_hash = hex::encode(payment_hash_from_bolt11(invoice)?);
        let expires_at = expiry_from_bolt11(invoice)?;
        self.pending
            .lock()
            .expect("pending invoices mutex poisoned")
            .insert(
                payment_hash,
                PendingInvoice {
                    label: label.to_string(),
                    expires_at,
                },
            );
        Ok(())
    }

    /// Labels of tracked invoices settled in `payments`. Unpaid invoices past
    /// their expiry are forgotten.
    fn take_settled(&self, payments: &[Payment]) -> Vec<String> {
        let mut pending = self
            .pending
            .lock()
            .expect("pending invoices mutex poisoned");
        let settled = payments
            .iter()
            .filter(|p| {
                p.direction == PaymentDirection::Inbound as i32
                    && p.status == PaymentStatus::Succeeded as i32
            })
            .filter_map(|p| pending.remove(&p.id))
            .map(|invoice| invoice.label)
            .collect();

        let now = unix_now();
        pending.retain(|_, invoice| {
            let live = invoice.expires_at > now;
            if !live {
                tracing::debug!(label = %invoice.label, "forgetting expired invoice");
            }
            live
        });
        settled
    }
}

#[async_trait]
impl LightningClient for LdkLightningClient {
    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice> {
        decode_bolt11(invoice)
    }

    async fn create_invoice(
        &self,
        amount_msat: u64,
        label: &str,
        expiry_secs: u32,
    ) -> Result<String> {
        let description = Bolt11InvoiceDescription {
            kind: Some(bolt11_invoice_description::Kind::Direct(label.to_string())),
        };

        let resp = self
            .client
            .bolt11_receive(Bolt11ReceiveRequest {
                amount_msat: Some(amount_msat),
                description: Some(description),
                expiry_secs,
            })
            .await
            .context("Bolt11Receive")?;

        self.track(label, &resp.invoice)?;
        Ok(resp.invoice)
    }

    fn track_invoice(&self, label: &str, invoice: &str) -> Result<()> {
        self.track(label, invoice)
    }

    async fn pay_invoice(&self, invoice: &str) -> Result<String> {
        let payment_id = self.send(invoice).await?;
        let preimage = self.wait_preimage(&payment_id, self.payment_timeout).await?;
        Ok(hex::encode(preimage))
    }

    async fn rebalance(&self, invoice: &str, channel_id: &str) -> Result<String> {
        // ldk-server picks the route; the channel is only a hint here.
        tracing::debug!(%channel_id, "paying claim invoice");
        self.pay_invoice(invoice).await
    }
}
