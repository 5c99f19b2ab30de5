mod support {
    pub mod fakes;
}

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context as _, Result};

use peer_swap::swap::{
    Asset, ErrorKind, EventType, PeerMessage, SqliteSwapStore, StateType, SwapCreationContext,
    SwapError, SwapRole, SwapStateMachine, SwapStore, SwapType, pubkey_hash,
};

use support::fakes::{Node, deliver, swap_id};

fn new_machine(swap_type: SwapType, role: SwapRole) -> SwapStateMachine {
    let ctx = SwapCreationContext {
        swap_id: "swap-1".to_string(),
        asset: Asset::Btc,
        amount: 100,
        peer: "bob".to_string(),
        channel_id: "chan-1".to_string(),
        initiator_id: "alice".to_string(),
        protocol_version: 1,
    };
    SwapStateMachine::new(ctx.new_swap(swap_type, role))
}

/// A swap-out maker that funded the opening tx and lost contact with the taker.
fn aborted_maker() -> Result<SwapStateMachine> {
    let mut swap = new_machine(SwapType::Out, SwapRole::Receiver);
    let maker = swap.data.local_pubkey()?;
    swap.previous = StateType::SwapOutReceiverTxMsgSent;
    swap.current = StateType::SwapOutReceiverSwapAborted;
    swap.data.maker_pubkey_hash = Some(pubkey_hash(&maker));
    swap.data.taker_pubkey_hash = Some("00".repeat(20));
    swap.data.claim_payment_hash = Some("11".repeat(32));
    swap.data.cltv = Some(160);
    swap.data.opening_tx_id = Some("opening-tx-0".to_string());
    swap.data.opening_tx_vout = Some(0);
    Ok(swap)
}

#[tokio::test]
async fn unhandled_event_is_an_error_and_keeps_state() -> Result<()> {
    let (node, _outbox) = Node::in_memory("alice")?;
    let mut swap = new_machine(SwapType::Out, SwapRole::Sender);

    let res = swap
        .send_event(node.services(), EventType::OnTxOpenedMessage, None)
        .await;
    assert!(matches!(
        res,
        Err(SwapError::UnhandledEvent {
            state: StateType::Default,
            event: EventType::OnTxOpenedMessage,
        })
    ));
    assert_eq!(swap.current, StateType::Default);
    Ok(())
}

#[tokio::test]
async fn ignorable_event_is_dropped() -> Result<()> {
    let (node, _outbox) = Node::in_memory("alice")?;
    let mut swap = new_machine(SwapType::In, SwapRole::Receiver);

    let handled = swap
        .send_event(node.services(), EventType::OnTxConfirmed, None)
        .await?;
    assert!(!handled);
    assert_eq!(swap.current, StateType::Default);
    assert!(node.services().store.get(&swap.id)?.is_none());
    Ok(())
}

#[tokio::test]
async fn every_transition_is_persisted() -> Result<()> {
    let (node, _outbox) = Node::in_memory("alice")?;
    let mut swap = new_machine(SwapType::Out, SwapRole::Sender);

    assert!(
        swap.send_event(node.services(), EventType::OnSwapOutStarted, None)
            .await?
    );
    assert_eq!(swap.current, StateType::SwapOutSenderAwaitFeeResponse);
    assert_eq!(swap.previous, StateType::SwapOutSenderSendRequest);

    let stored = node
        .services()
        .store
        .get(&swap.id)?
        .context("swap not persisted")?;
    assert_eq!(stored.current, StateType::SwapOutSenderAwaitFeeResponse);
    assert_eq!(stored.data.taker_pubkey_hash, swap.data.taker_pubkey_hash);
    assert_eq!(stored.data.privkey_hex, swap.data.privkey_hex);
    assert!(stored.data.next_message.is_none());
    Ok(())
}

#[tokio::test]
async fn failed_send_cancels_without_messaging() -> Result<()> {
    let store = Arc::new(SqliteSwapStore::open_in_memory()?);
    let (node, outbox) = Node::new("alice", store);
    drop(outbox);

    let mut swap = new_machine(SwapType::In, SwapRole::Sender);
    swap.send_event(node.services(), EventType::OnSwapInStarted, None)
        .await?;
    assert_eq!(swap.current, StateType::SwapCanceled);
    let last_err = swap.data.last_err.context("last_err")?;
    assert_eq!(last_err.kind, ErrorKind::Infrastructure);
    assert!(last_err.message.contains("send swap_in_request"), "{}", last_err.message);
    Ok(())
}

#[tokio::test]
async fn claim_is_retried_until_it_succeeds() -> Result<()> {
    let (node, _outbox) = Node::in_memory("bob")?;
    node.chain.failing_claims.store(1, Ordering::SeqCst);
    let mut swap = aborted_maker()?;

    swap.send_event(node.services(), EventType::OnCltvPassed, None)
        .await?;
    assert_eq!(swap.current, StateType::ClaimedCltv);
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(swap.data.claim_tx_id.as_deref(), Some("claim-cltv:opening-tx-0"));
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_park_the_swap() -> Result<()> {
    let (node, _outbox) = Node::in_memory("bob")?;
    node.chain.failing_claims.store(10, Ordering::SeqCst);
    let mut swap = aborted_maker()?;

    let res = swap
        .send_event(node.services(), EventType::OnCltvPassed, None)
        .await;
    assert!(matches!(
        res,
        Err(SwapError::UnhandledEvent {
            state: StateType::SwapOutReceiverClaimSwapCltv,
            event: EventType::ActionFailed,
        })
    ));
    // max_action_retries = 2: the first attempt plus two retries.
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(swap.current, StateType::SwapOutReceiverClaimSwapCltv);
    assert_eq!(swap.retries, 2);

    let stored = node
        .services()
        .store
        .get(&swap.id)?
        .context("swap not persisted")?;
    assert_eq!(stored.current, StateType::SwapOutReceiverClaimSwapCltv);
    let last_err = stored.data.last_err.context("last_err")?;
    assert_eq!(last_err.kind, ErrorKind::Unhandled);
    Ok(())
}

#[tokio::test]
async fn missing_asset_backend_fails_the_action() -> Result<()> {
    let (node, _outbox) = Node::in_memory("bob")?;
    let mut services = node.services().clone();
    services.bitcoin = None;
    let mut swap = aborted_maker()?;

    // The claim never reaches the chain; without a chain the swap stays parked.
    let res = swap
        .send_event(&services, EventType::OnCltvPassed, None)
        .await;
    assert!(res.is_err());
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 0);
    let last_err = swap.data.last_err.context("last_err")?;
    assert_eq!(last_err.kind, ErrorKind::Unhandled);
    Ok(())
}

#[tokio::test]
async fn parked_claim_resumes_on_redelivery_after_restart() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("bob.sqlite3");
    {
        let store = SqliteSwapStore::open(path.clone())?;
        let (node, _outbox) = Node::new("bob", Arc::new(store));
        node.chain.failing_claims.store(3, Ordering::SeqCst);
        let mut swap = aborted_maker()?;
        let res = swap
            .send_event(node.services(), EventType::OnCltvPassed, None)
            .await;
        assert!(res.is_err());
        assert_eq!(swap.current, StateType::SwapOutReceiverClaimSwapCltv);
    }

    let (node, _outbox) = Node::new("bob", Arc::new(SqliteSwapStore::open(path)?));
    assert_eq!(node.service.start()?, 1);
    assert_eq!(node.state("swap-1").await?, StateType::SwapOutReceiverClaimSwapCltv);
    assert!(node.service.has_active_swap_on_channel("chan-1"));

    node.service.on_cltv_passed("swap-1").await?;
    assert_eq!(node.state("swap-1").await?, StateType::ClaimedCltv);
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 1);
    assert!(!node.service.has_active_swap_on_channel("chan-1"));
    Ok(())
}

#[tokio::test]
async fn parked_claim_resumes_on_request() -> Result<()> {
    let (node, _outbox) = Node::in_memory("bob")?;
    node.chain.failing_claims.store(3, Ordering::SeqCst);
    let mut swap = aborted_maker()?;
    assert!(
        swap.send_event(node.services(), EventType::OnCltvPassed, None)
            .await
            .is_err()
    );
    node.service.add_active_swap(swap)?;

    node.service.resume("swap-1").await?;
    assert_eq!(node.state("swap-1").await?, StateType::ClaimedCltv);
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 4);
    assert!(!node.service.has_active_swap_on_channel("chan-1"));

    // Nothing left to run on a finished swap.
    node.service.resume("swap-1").await?;
    assert_eq!(node.chain.claim_attempts.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn recovered_swap_mid_fee_payment_continues() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("alice.sqlite3");

    let (bob, mut to_alice) = Node::in_memory("bob")?;
    let (id, fee_response) = {
        let store = SqliteSwapStore::open(path.clone())?;
        let (alice, mut to_bob) = Node::new("alice", Arc::new(store));
        let swap = alice
            .service
            .swap_out("bob", Asset::Btc, "chan-1", "alice", 100)
            .await?;
        let id = swap_id(&swap).await;
        deliver(&bob, &mut to_bob).await?;
        let fee_response = to_alice.try_recv().context("no fee response")?;

        // Stored as if the process died right after entering the payment step.
        let mut stored = alice
            .services()
            .store
            .get(&id)?
            .context("swap not persisted")?;
        PeerMessage::decode(&fee_response.msg_type, &fee_response.payload)?
            .apply_on_swap(&mut stored.data);
        stored.previous = stored.current;
        stored.current = StateType::SwapOutSenderPayFeeInvoice;
        alice.services().store.put(&stored)?;
        (id, fee_response)
    };

    let (alice, _to_bob) = Node::new("alice", Arc::new(SqliteSwapStore::open(path)?));
    assert_eq!(alice.service.start()?, 1);
    assert_eq!(alice.state(&id).await?, StateType::SwapOutSenderPayFeeInvoice);

    alice
        .service
        .on_message_received("bob", &fee_response.msg_type, &fee_response.payload)
        .await?;
    assert_eq!(alice.state(&id).await?, StateType::SwapOutSenderAwaitTxBroadcastedMessage);
    assert_eq!(alice.lightning.paid().len(), 1);

    // Once past the payment step a further copy is not paid again.
    let res = alice
        .service
        .on_message_received("bob", &fee_response.msg_type, &fee_response.payload)
        .await;
    assert!(matches!(res, Err(SwapError::UnhandledEvent { .. })));
    assert_eq!(alice.lightning.paid().len(), 1);

    bob.service.on_payment_received(&format!("fee_{id}")).await?;
    deliver(&alice, &mut to_alice).await?;
    assert_eq!(alice.state(&id).await?, StateType::SwapOutSenderAwaitTxConfirmation);
    Ok(())
}
