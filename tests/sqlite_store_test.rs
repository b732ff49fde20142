use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use wasession::auth::{AuthState, KeyCategory};
use wasession::store::sqlite_store::SqliteStore;
use wasession::store::{
    ChatRecord, ContactRecord, DataStore, LabelRecord, MessageRecord, MessageUpdateRecord,
};

const INSTANCE: &str = "inst-1";

async fn test_store(name: &str) -> SqliteStore {
    let _ = env_logger::builder().is_test(true).try_init();

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    let url = format!(
        "file:memdb_{}_{}_{}?mode=memory&cache=shared",
        name,
        unique,
        std::process::id()
    );
    SqliteStore::new(&url).await.unwrap()
}

fn message(id: &str) -> MessageRecord {
    MessageRecord {
        key_id: id.to_string(),
        remote_jid: "a@s.whatsapp.net".to_string(),
        from_me: false,
        participant: None,
        push_name: Some("Ann".to_string()),
        content: json!({ "conversation": "hello" }),
        message_type: "conversation".to_string(),
        message_timestamp: 1_700_000_000,
        status: None,
        source: Some("android".to_string()),
    }
}

#[tokio::test]
async fn bulk_message_insert_skips_duplicates() {
    let store = test_store("messages").await;

    let rows = vec![message("m1"), message("m2")];
    assert_eq!(store.insert_messages(INSTANCE, &rows).await.unwrap(), 2);

    // Same batch again: every row is silently skipped.
    assert_eq!(store.insert_messages(INSTANCE, &rows).await.unwrap(), 0);

    let ids = store.message_ids(INSTANCE).await.unwrap();
    assert_eq!(ids.len(), 2);

    let found = store.find_message(INSTANCE, "m1").await.unwrap().unwrap();
    assert_eq!(found.content["conversation"], "hello");
    assert_eq!(found.source.as_deref(), Some("android"));
}

#[tokio::test]
async fn rows_are_scoped_per_instance() {
    let store = test_store("scoping").await;

    store.insert_messages("inst-a", &[message("m1")]).await.unwrap();

    assert!(store.find_message("inst-b", "m1").await.unwrap().is_none());
    assert_eq!(
        store.insert_messages("inst-b", &[message("m1")]).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn chat_insert_update_delete_and_labels() {
    let store = test_store("chats").await;

    let chat = ChatRecord {
        remote_jid: "a@s.whatsapp.net".to_string(),
        last_msg_timestamp: None,
        labels: Vec::new(),
    };
    assert_eq!(
        store
            .insert_chats(INSTANCE, std::slice::from_ref(&chat))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .insert_chats(INSTANCE, std::slice::from_ref(&chat))
            .await
            .unwrap(),
        0
    );

    store
        .update_chat_last_message(INSTANCE, "a@s.whatsapp.net", 1_700_000_123)
        .await
        .unwrap();

    store
        .set_chat_labels(
            INSTANCE,
            "a@s.whatsapp.net",
            &["label-1".to_string(), "label-2".to_string()],
        )
        .await
        .unwrap();
    let labels = store
        .chat_labels(INSTANCE, "a@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(labels, vec!["label-1".to_string(), "label-2".to_string()]);

    store.delete_chat(INSTANCE, "a@s.whatsapp.net").await.unwrap();
    assert!(
        store
            .chat_labels(INSTANCE, "a@s.whatsapp.net")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn contact_upsert_overwrites_existing_row() {
    let store = test_store("contacts").await;

    let contact = ContactRecord {
        remote_jid: "a@s.whatsapp.net".to_string(),
        push_name: Some("Ann".to_string()),
        profile_pic_url: None,
    };
    store.upsert_contact(INSTANCE, &contact).await.unwrap();

    let updated = ContactRecord {
        profile_pic_url: Some("https://pps.example.net/a.jpg".to_string()),
        ..contact
    };
    store.upsert_contact(INSTANCE, &updated).await.unwrap();

    let found = store
        .find_contact(INSTANCE, "a@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        found.profile_pic_url.as_deref(),
        Some("https://pps.example.net/a.jpg")
    );
}

#[tokio::test]
async fn message_update_ledger_is_append_only_and_ordered() {
    let store = test_store("ledger").await;
    store.insert_messages(INSTANCE, &[message("m1")]).await.unwrap();

    for status in ["SERVER_ACK", "DELIVERY_ACK", "READ"] {
        store
            .append_message_update(
                INSTANCE,
                &MessageUpdateRecord {
                    key_id: "m1".to_string(),
                    remote_jid: "a@s.whatsapp.net".to_string(),
                    from_me: true,
                    participant: None,
                    status: status.to_string(),
                    date_time: 1_700_000_000_000,
                    poll_updates: None,
                },
            )
            .await
            .unwrap();
    }

    let ledger = store.message_updates(INSTANCE, "m1").await.unwrap();
    let statuses: Vec<&str> = ledger.iter().map(|row| row.status.as_str()).collect();
    assert_eq!(statuses, ["SERVER_ACK", "DELIVERY_ACK", "READ"]);
}

#[tokio::test]
async fn label_upsert_and_delete() {
    let store = test_store("labels").await;

    let label = LabelRecord {
        label_id: "label-1".to_string(),
        name: "Customers".to_string(),
        color: "7".to_string(),
        predefined_id: None,
    };
    store.upsert_label(INSTANCE, &label).await.unwrap();

    let renamed = LabelRecord {
        name: "Leads".to_string(),
        ..label
    };
    store.upsert_label(INSTANCE, &renamed).await.unwrap();

    let found = store.find_label(INSTANCE, "label-1").await.unwrap().unwrap();
    assert_eq!(found.name, "Leads");

    store.delete_label(INSTANCE, "label-1").await.unwrap();
    assert!(store.find_label(INSTANCE, "label-1").await.unwrap().is_none());
}

#[tokio::test]
async fn auth_state_blob_round_trips() {
    let store = test_store("auth").await;

    let mut state = AuthState::bootstrap();
    state.creds.me = Some("5544999999999@s.whatsapp.net".parse().unwrap());
    state.creds.registered = true;
    state.set_key(KeyCategory::PreKey, "7", vec![7, 7, 7]);

    store.save_auth_state("inst", &state).await.unwrap();
    let loaded = store.load_auth_state("inst").await.unwrap().unwrap();
    assert!(loaded.creds.registered);
    assert_eq!(loaded.get_key(KeyCategory::PreKey, "7"), Some(&vec![7, 7, 7]));

    // Overwrite is atomic at the row level: a reload sees the new state.
    state.creds.push_name = Some("Ann".to_string());
    store.save_auth_state("inst", &state).await.unwrap();
    let reloaded = store.load_auth_state("inst").await.unwrap().unwrap();
    assert_eq!(reloaded.creds.push_name.as_deref(), Some("Ann"));

    store.delete_auth_state("inst").await.unwrap();
    assert!(store.load_auth_state("inst").await.unwrap().is_none());
}
