//! Inbound messages, chain events and history loading.

mod common;

use common::{Network, ALICE, BOB};
use stardust_chat::{
    ChainEvent, ChatError, ContentStore, EncryptedBlob, MessageType, SessionRecord, StorageError,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_inbound_message_counts_unread() {
    let net = Network::new();
    let sent = net
        .alice
        .send_message(BOB, "Hello Bob", MessageType::Text)
        .await
        .unwrap();

    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;

    let list = net.bob.messages(&net.session_id());
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].content, "Hello Bob");
    assert_eq!(list[0].sender, ALICE);
    assert_eq!(list[0].id, sent.id);
    assert!(!list[0].is_read);
    assert!(list[0].content_error.is_none());

    assert_eq!(net.bob.total_unread(), 1);
    assert_eq!(net.bob.session(&net.session_id()).unwrap().unread_count, 1);

    let msg_id = sent.id.confirmed().unwrap();
    assert_eq!(net.bob.mark_as_read(&[msg_id]).await.unwrap(), 1);
    assert_eq!(net.bob.total_unread(), 0);
    assert_eq!(net.chain.read_marks(), vec![msg_id]);

    // Marking again changes nothing and never underflows.
    assert_eq!(net.bob.mark_as_read(&[msg_id]).await.unwrap(), 0);
    assert_eq!(net.bob.total_unread(), 0);
}

#[tokio::test]
async fn test_duplicate_events_are_ignored() {
    let net = Network::new();
    net.alice
        .send_message(BOB, "once", MessageType::Text)
        .await
        .unwrap();
    let record = net.chain.last_record();

    net.bob.handle_event(ChainEvent::NewMessage(record.clone())).await;
    net.bob.handle_event(ChainEvent::NewMessage(record)).await;
    assert_eq!(net.bob.messages(&net.session_id()).len(), 1);
    assert_eq!(net.bob.total_unread(), 1);
}

#[tokio::test]
async fn test_blocked_sender_is_dropped() {
    let net = Network::new();
    net.bob.block_user(ALICE).await.unwrap();
    assert!(net.bob.is_blocked(ALICE));

    net.alice
        .send_message(BOB, "let me in", MessageType::Text)
        .await
        .unwrap();
    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;
    assert!(net.bob.messages(&net.session_id()).is_empty());
    assert_eq!(net.bob.total_unread(), 0);

    net.bob.unblock_user(ALICE).await.unwrap();
    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;
    assert_eq!(net.bob.messages(&net.session_id()).len(), 1);
}

#[tokio::test]
async fn test_unreadable_content_is_kept_with_error() {
    let net = Network::new();
    net.alice
        .send_message(BOB, "fragile", MessageType::Text)
        .await
        .unwrap();
    let record = net.chain.last_record();

    let stored = net.content.fetch(&record.content_cid).await.unwrap();
    let mut blob = EncryptedBlob::from_base64(&String::from_utf8(stored).unwrap()).unwrap();
    blob.ciphertext[0] ^= 0xff;
    net.content
        .corrupt(&record.content_cid, blob.to_base64().into_bytes())
        .await;

    net.bob.handle_event(ChainEvent::NewMessage(record)).await;
    let list = net.bob.messages(&net.session_id());
    assert_eq!(list.len(), 1);
    assert!(list[0].content.is_empty());
    assert!(list[0].content_error.as_ref().unwrap().is_tampering());

    let mut missing = net.chain.last_record();
    missing.msg_id = 999;
    missing.content_cid = stardust_chat::Cid::from("bafy-missing");
    net.bob.handle_event(ChainEvent::NewMessage(missing)).await;
    let list = net.bob.messages(&net.session_id());
    assert_eq!(list.len(), 2);
    let error = list[1].content_error.clone().unwrap();
    assert!(!error.is_tampering());
    assert!(matches!(error, ChatError::Storage(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_read_receipt_and_delete_events() {
    let net = Network::new();
    let sent = net
        .alice
        .send_message(BOB, "read me", MessageType::Text)
        .await
        .unwrap();
    let msg_id = sent.id.confirmed().unwrap();

    net.alice
        .handle_event(ChainEvent::MessageRead {
            msg_id,
            reader: BOB.to_string(),
        })
        .await;
    assert!(net.alice.messages(&net.session_id())[0].is_read);

    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;
    assert_eq!(net.bob.total_unread(), 1);
    net.bob
        .handle_event(ChainEvent::MessageDeleted { msg_id })
        .await;
    assert!(net.bob.messages(&net.session_id()).is_empty());
    assert_eq!(net.bob.total_unread(), 0);

    assert!(net.alice.delete_message(msg_id).await.unwrap());
    assert!(net.alice.messages(&net.session_id()).is_empty());
}

#[tokio::test]
async fn test_session_and_block_events() {
    let net = Network::new();
    net.bob
        .handle_event(ChainEvent::SessionCreated(SessionRecord {
            session_id: "s-carol".to_string(),
            participant: "carol".to_string(),
            unread_count: 2,
            is_archived: false,
        }))
        .await;
    assert_eq!(net.bob.sessions().len(), 1);
    assert_eq!(net.bob.total_unread(), 2);

    net.bob
        .handle_event(ChainEvent::UserBlocked {
            blocker: BOB.to_string(),
            blocked: "carol".to_string(),
        })
        .await;
    net.bob
        .handle_event(ChainEvent::UserBlocked {
            blocker: ALICE.to_string(),
            blocked: "dave".to_string(),
        })
        .await;
    assert_eq!(net.bob.blocked_users(), vec!["carol".to_string()]);

    net.bob
        .handle_event(ChainEvent::UserUnblocked {
            blocker: BOB.to_string(),
            blocked: "carol".to_string(),
        })
        .await;
    assert!(net.bob.blocked_users().is_empty());
}

#[tokio::test]
async fn test_run_drains_event_stream() {
    let net = Network::new();
    for text in ["one", "two"] {
        net.alice
            .send_message(BOB, text, MessageType::Text)
            .await
            .unwrap();
    }

    let (tx, rx) = mpsc::channel(8);
    for record in net.chain.records() {
        tx.send(ChainEvent::NewMessage(record)).await.unwrap();
    }
    drop(tx);

    net.bob.run(rx).await;
    let list = net.bob.messages(&net.session_id());
    assert_eq!(list.len(), 2);
    assert_eq!(list[1].content, "two");
    assert_eq!(net.bob.total_unread(), 2);
}

#[tokio::test]
async fn test_subscription_feeds_service() {
    let net = Network::new();
    let bob = net.bob.clone();
    let runner = tokio::spawn(async move { bob.subscribe_and_run().await });

    // Wait for the subscription to register.
    while net.chain.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    net.alice
        .send_message(BOB, "pushed", MessageType::Text)
        .await
        .unwrap();
    net.chain
        .emit(ChainEvent::NewMessage(net.chain.last_record()))
        .await;
    net.chain.close_subscriptions();

    runner.await.unwrap().unwrap();
    assert_eq!(net.bob.messages(&net.session_id())[0].content, "pushed");
}

#[tokio::test]
async fn test_load_sessions_and_mark_session_read() {
    let net = Network::new();
    net.chain.add_session(SessionRecord {
        session_id: net.session_id(),
        participant: ALICE.to_string(),
        unread_count: 3,
        is_archived: false,
    });
    net.chain.add_session(SessionRecord {
        session_id: "s-carol".to_string(),
        participant: "carol".to_string(),
        unread_count: 2,
        is_archived: false,
    });

    let sessions = net.bob.load_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(net.bob.total_unread(), 5);

    assert_eq!(net.bob.mark_session_as_read("s-carol").await.unwrap(), 2);
    assert_eq!(net.bob.total_unread(), 3);
    assert!(net.bob.mark_session_as_read("nope").await.is_err());

    net.bob.archive_session("s-carol").await.unwrap();
    assert!(net.bob.session("s-carol").unwrap().is_archived);

    let selected = net.bob.select_session(&net.session_id()).unwrap();
    assert_eq!(selected.participant, ALICE);
    assert_eq!(net.bob.current_session().unwrap().id, net.session_id());
}

#[tokio::test]
async fn test_load_messages_pages_history() {
    let net = Network::with_config(stardust_chat::ChatConfig {
        page_size: 2,
        ..stardust_chat::ChatConfig::localnet()
    });
    for text in ["m1", "m2", "m3", "m4", "m5"] {
        net.alice
            .send_message(BOB, text, MessageType::Text)
            .await
            .unwrap();
    }

    let first = net.bob.load_messages(&net.session_id(), 0).await.unwrap();
    let texts: Vec<&str> = first.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["m4", "m5"]);

    let older = net.bob.load_messages(&net.session_id(), 2).await.unwrap();
    let texts: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["m2", "m3", "m4", "m5"]);

    // Both sides derive the same key, so the sender can read its own history.
    let own = net.alice.load_messages(&net.session_id(), 0).await.unwrap();
    assert_eq!(own.len(), 2);
    assert!(own.iter().all(|m| m.content_error.is_none()));
}

#[tokio::test]
async fn test_deleted_records_are_hidden_from_history() {
    let net = Network::new();
    net.alice
        .send_message(BOB, "regret", MessageType::Text)
        .await
        .unwrap();
    let mut record = net.chain.last_record();
    record.msg_id = 77;
    record.is_deleted_by_receiver = true;
    net.chain.add_record(record);

    let history = net.bob.load_messages(&net.session_id(), 0).await.unwrap();
    assert_eq!(history.len(), 1);

    let own = net.alice.load_messages(&net.session_id(), 0).await.unwrap();
    assert_eq!(own.len(), 2);
}

#[tokio::test]
async fn test_inbound_leaves_other_sessions_alone() {
    let net = Network::new();
    net.chain.add_session(SessionRecord {
        session_id: "s-carol".to_string(),
        participant: "carol".to_string(),
        unread_count: 0,
        is_archived: false,
    });
    net.bob.load_sessions().await.unwrap();
    net.bob.select_session("s-carol").unwrap();
    let carol_before = net.bob.session("s-carol").unwrap();

    net.alice
        .send_message(BOB, "psst", MessageType::Text)
        .await
        .unwrap();
    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;

    assert_eq!(net.bob.total_unread(), 1);
    assert_eq!(net.bob.session(&net.session_id()).unwrap().unread_count, 1);
    assert_eq!(net.bob.session("s-carol").unwrap(), carol_before);
    assert_eq!(net.bob.current_session().unwrap().id, "s-carol");
}

#[tokio::test]
async fn test_history_reconciles_unread() {
    let net = Network::new();
    for text in ["m1", "m2"] {
        net.alice
            .send_message(BOB, text, MessageType::Text)
            .await
            .unwrap();
    }
    net.bob
        .handle_event(ChainEvent::NewMessage(net.chain.last_record()))
        .await;
    assert_eq!(net.bob.total_unread(), 1);

    let history = net.bob.load_messages(&net.session_id(), 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(net.bob.session(&net.session_id()).unwrap().unread_count, 2);
    assert_eq!(net.bob.total_unread(), 2);

    let ids: Vec<u64> = history.iter().filter_map(|m| m.id.confirmed()).collect();
    assert_eq!(net.bob.mark_as_read(&ids).await.unwrap(), 2);
    assert_eq!(net.bob.total_unread(), 0);
}

#[tokio::test]
async fn test_history_creates_missing_session() {
    let net = Network::new();
    net.alice
        .send_message(BOB, "first contact", MessageType::Text)
        .await
        .unwrap();

    let history = net.bob.load_messages(&net.session_id(), 0).await.unwrap();
    assert_eq!(history.len(), 1);

    let session = net.bob.session(&net.session_id()).unwrap();
    assert_eq!(session.participant, ALICE);
    assert_eq!(session.unread_count, 1);
    assert_eq!(session.last_message.unwrap().preview, "first contact");
    assert_eq!(net.bob.total_unread(), 1);

    assert_eq!(net.bob.mark_session_as_read(&net.session_id()).await.unwrap(), 1);
    assert_eq!(net.bob.total_unread(), 0);
}
