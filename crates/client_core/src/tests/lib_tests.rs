use super::*;

use std::time::Duration;

use serde_json::json;
use shared::domain::UserId;

use crate::test_support::{FakeChatServer, PASSWORD};

fn settings_for(server_url: &str) -> ClientSettings {
    ClientSettings {
        server_url: server_url.to_string(),
        reconnect_delay_ms: 20,
        max_reconnect_attempts: 5,
        mirror_database_url: "sqlite::memory:".into(),
        request_timeout_secs: 5,
    }
}

async fn client_for(server: &FakeChatServer) -> Arc<ChatClient> {
    client_with_mirror(server, Arc::new(MemoryMirror::new()))
}

fn client_with_mirror(server: &FakeChatServer, mirror: Arc<MemoryMirror>) -> Arc<ChatClient> {
    ChatClient::new(settings_for(&server.url), mirror).expect("build client")
}

async fn seeded_server() -> FakeChatServer {
    let server = FakeChatServer::spawn().await.expect("spawn server");
    server
        .add_conversation("c1", &[("id-alice", "alice"), ("id-bob", "bob")])
        .await;
    server
        .add_conversation("c2", &[("id-alice", "alice"), ("id-carol", "carol")])
        .await;
    server.add_message("c1", "id-bob", "hi alice", 100).await;
    server
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("client events closed"),
            }
        }
    })
    .await
    .expect("client event in time")
}

fn connection_event(state: ConnectionState) -> impl Fn(&ClientEvent) -> bool {
    move |event| *event == ClientEvent::Sync(SyncEvent::Connection(state))
}

async fn wait_for_snapshot(
    client: &ChatClient,
    check: impl Fn(&ConversationState) -> bool,
) -> ConversationState {
    for _ in 0..300 {
        let snapshot = client.snapshot().await;
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("conversation state never matched");
}

#[tokio::test]
async fn login_opens_the_session_and_the_channel() {
    let server = seeded_server().await;
    let client = client_for(&server).await;
    let mut events = client.subscribe_events();

    let user = client.login("alice", PASSWORD).await.expect("login");

    assert_eq!(user.id, UserId::new("id-alice"));
    assert_eq!(client.current_user().await, Some(user.clone()));
    assert_eq!(
        next_event(&mut events, |e| matches!(e, ClientEvent::SessionStarted(_))).await,
        ClientEvent::SessionStarted(user)
    );
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.conversations.len(), 2);
    assert_eq!(snapshot.conversations[0].display_name, "bob");
    assert_eq!(server.data.lock().await.socket_tokens, vec!["access-0".to_string()]);
}

#[tokio::test]
async fn rejected_login_leaves_everything_closed() {
    let server = seeded_server().await;
    let client = client_for(&server).await;

    let err = client
        .login("alice", "wrong")
        .await
        .expect_err("bad password");

    assert!(matches!(err, ClientError::Api(ref api) if api.status == 400));
    assert!(client.current_user().await.is_none());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(server.data.lock().await.socket_connections, 0);
}

#[tokio::test]
async fn dropped_channel_reconnects_without_touching_presence_or_unread() {
    let server = seeded_server().await;
    let client = client_for(&server).await;
    let mut events = client.subscribe_events();
    client.login("alice", PASSWORD).await.expect("login");
    client
        .open_conversation(&ConversationId::new("c1"))
        .await
        .expect("open c1");
    assert!(server.wait_for_live_sockets(1).await);

    server.push(json!({ "type": "user_online", "sender_id": "id-bob" }));
    server.push(json!({
        "type": "new_message",
        "conversation_id": "c2",
        "sender_id": "id-carol",
        "message": "are you there?",
        "created_at": 200,
    }));
    let before = wait_for_snapshot(&client, |s| {
        s.is_online(&UserId::new("id-bob")) && s.is_unread(&ConversationId::new("c2"))
    })
    .await;

    server.drop_sockets();
    next_event(&mut events, connection_event(ConnectionState::Reconnecting)).await;
    next_event(&mut events, connection_event(ConnectionState::Connected)).await;

    let after = client.snapshot().await;
    assert_eq!(after.online, before.online);
    assert_eq!(after.unread, before.unread);
    assert_eq!(server.data.lock().await.socket_connections, 2);
}

#[tokio::test]
async fn logout_revokes_and_disconnects() {
    let server = seeded_server().await;
    let mirror = Arc::new(MemoryMirror::new());
    let client = client_with_mirror(&server, mirror.clone());
    let mut events = client.subscribe_events();
    client.login("alice", PASSWORD).await.expect("login");
    client
        .open_conversation(&ConversationId::new("c1"))
        .await
        .expect("open c1");
    let alice = UserId::new("id-alice");
    assert!(mirror
        .load(&MirrorKey::Conversations(alice.clone()))
        .await
        .expect("load")
        .is_some());

    client.logout().await;

    next_event(&mut events, |e| *e == ClientEvent::SessionEnded).await;
    assert!(client.current_user().await.is_none());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(client.snapshot().await.conversations.is_empty());
    for key in [
        MirrorKey::Conversations(alice.clone()),
        MirrorKey::CurrentConversation(alice),
    ] {
        assert!(mirror.load(&key).await.expect("load").is_none());
    }
    let data = server.data.lock().await;
    assert_eq!(data.logouts.len(), 1);
    assert_eq!(data.logouts[0].user_id, "id-alice");
    assert_eq!(data.logouts[0].refresh_token, "refresh-0");
}

#[tokio::test]
async fn failed_renewal_tears_the_session_down() {
    let server = seeded_server().await;
    let mirror = Arc::new(MemoryMirror::new());
    let client = client_with_mirror(&server, mirror.clone());
    let mut events = client.subscribe_events();
    client.login("alice", PASSWORD).await.expect("login");
    {
        let mut data = server.data.lock().await;
        data.fail_refresh = true;
    }
    server.expire_access_token().await;

    let err = client
        .refresh_conversations()
        .await
        .expect_err("renewal fails");
    assert!(err.is_refresh_failure());

    let expired = next_event(&mut events, |e| {
        matches!(e, ClientEvent::SessionExpired { .. })
    })
    .await;
    assert!(matches!(expired, ClientEvent::SessionExpired { reason } if reason.contains("refresh token is invalid")));
    assert!(client.current_user().await.is_none());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(client.snapshot().await.local_user.is_none());
    assert!(mirror
        .load(&MirrorKey::Conversations(UserId::new("id-alice")))
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn reconnect_after_renewal_uses_the_new_credential() {
    let server = seeded_server().await;
    let client = client_for(&server).await;
    client.login("alice", PASSWORD).await.expect("login");
    server.expire_access_token().await;

    client
        .refresh_conversations()
        .await
        .expect("refresh after renewal");
    assert_eq!(server.data.lock().await.refresh_calls, 1);

    server.drop_sockets();
    assert!(
        server
            .wait_for(|data| data.socket_tokens.last().map(String::as_str) == Some("access-1"))
            .await
    );
}

#[tokio::test]
async fn start_conversation_by_phone() {
    let server = seeded_server().await;
    let client = client_for(&server).await;
    client.login("alice", PASSWORD).await.expect("login");

    let created = client.start_conversation("777").await.expect("start");

    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.conversations[0].id, created);
    assert_eq!(snapshot.open, Some(created));
    assert!(server
        .wait_for(|data| data
            .socket_inbound
            .iter()
            .any(|frame| frame["type"] == "join_conversation" && frame["conversation_id"] == "c-777"))
        .await);
}
