use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr as _;

use crate::swap::DecodedInvoice;

fn parse(invoice: &str) -> Result<Bolt11Invoice> {
    Bolt11Invoice::from_str(invoice).map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))
}

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<[u8; 32]> {
    Ok(parse(invoice)?.payment_hash().to_byte_array())
}

/// Unix time in seconds after which the invoice can no longer be paid.
pub fn expiry_from_bolt11(invoice: &str) -> Result<u64> {
    let invoice = parse(invoice)?;
    Ok(invoice
        .duration_since_epoch()
        .saturating_add(invoice.expiry_time())
        .as_secs())
}

/// Swap invoices always carry an amount; amountless invoices are rejected.
pub fn decode_bolt11(invoice: &str) -> Result<DecodedInvoice> {
    let invoice = parse(invoice)?;
    let amount_msat = invoice
        .amount_milli_satoshis()
        .context("BOLT11 invoice has no amount")?;
    Ok(DecodedInvoice {
        amount_msat,
        payment_hash: hex::encode(invoice.payment_hash().to_byte_array()),
    })
}
