#![forbid(unsafe_code)]

//! End-to-end tests driving `handle_connection` over a real QUIC endpoint
//! with an in-memory store.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use homeroom_client_core::token::mint_user_token;
use homeroom_client_core::{ClientConfigV1, SessionControl};
use homeroom_domain::{Community, CommunityId, MessageDraft, MessageId, RosterEntry, SecretString, UserId};
use homeroom_protocol::pb;
use tokio::sync::{RwLock, mpsc};

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::state::GlobalState;
use crate::server::store::Store;

const TEST_SECRET: &str = "test-hmac-secret";
const ADMIN_USER: &str = "user-IPA-1";
const COMMUNITY_ADMIN: &str = "u-lead";
const PLAIN_USER: &str = "u-resident";

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_logging() {
	LOG_INIT.get_or_init(|| {
		let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();
	});
}

struct TestServer {
	addr: SocketAddr,
	store: Arc<Store>,
	_endpoint: quinn::Endpoint,
}

async fn start_server() -> TestServer {
	init_logging();
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let bind: SocketAddr = "127.0.0.1:0".parse().expect("bind addr");
	let quic = QuicServerConfig::dev(bind);
	let (endpoint, _cert_der) = quic.bind_dev_endpoint().expect("bind dev endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	let store = Arc::new(Store::connect("sqlite::memory:").await.expect("connect store"));
	let state = Arc::new(RwLock::new(GlobalState::default()));
	let room_hub = RoomHub::new(RoomHubConfig::default());
	let settings = ConnectionSettings {
		auth_hmac_secret: Some(SecretString::new(TEST_SECRET)),
		..ConnectionSettings::default()
	};

	let accept_endpoint = endpoint.clone();
	let accept_store = Arc::clone(&store);
	tokio::spawn(async move {
		let mut next_conn_id: u64 = 0;
		while let Some(incoming) = accept_endpoint.accept().await {
			let Ok(connection) = incoming.await else { continue };
			next_conn_id += 1;
			let conn_id = next_conn_id;
			let state = Arc::clone(&state);
			let room_hub = room_hub.clone();
			let store = Arc::clone(&accept_store);
			let settings = settings.clone();
			tokio::spawn(async move {
				let _ = handle_connection(conn_id, connection, state, room_hub, store, settings).await;
			});
		}
	});

	TestServer {
		addr,
		store,
		_endpoint: endpoint,
	}
}

fn client_config(addr: SocketAddr) -> ClientConfigV1 {
	ClientConfigV1 {
		server_host: "localhost".to_string(),
		server_port: addr.port(),
		server_addr: Some(addr),
		connect_timeout: Duration::from_secs(5),
		..ClientConfigV1::default()
	}
}

fn token_for(user_id: &str) -> String {
	mint_user_token(user_id, TEST_SECRET, Duration::from_secs(600))
}

async fn seed_community(store: &Store, id: &str, with_collection: bool) -> CommunityId {
	let community_id = CommunityId::new(id).expect("community id");
	let community = Community {
		id: community_id.clone(),
		name: "Maple Grove".to_string(),
		state: "TX".to_string(),
		city: "Austin".to_string(),
		builder: "Acme Homes".to_string(),
		thumbnail: None,
		projects: Vec::new(),
		members: vec![
			RosterEntry {
				user_id: UserId::new(COMMUNITY_ADMIN).expect("id"),
				name: "Lead".to_string(),
				phone: None,
				profile_picture: None,
				is_admin: true,
			},
			RosterEntry {
				user_id: UserId::new(PLAIN_USER).expect("id"),
				name: "Resident".to_string(),
				phone: None,
				profile_picture: None,
				is_admin: false,
			},
		],
	};
	store.create_community(&community, 1_000).await.expect("create community");
	if with_collection {
		store.create_collection(&community_id, 1_000).await.expect("create collection");
	}
	community_id
}

async fn seed_message(store: &Store, community: &CommunityId, user_id: &str, text: &str) -> MessageId {
	let id = MessageId::new_v4();
	store
		.append_message(
			community,
			id,
			&MessageDraft {
				user_id: UserId::new(user_id).expect("id"),
				user_name: "Seeded".to_string(),
				user_profile_picture: None,
				text: Some(text.to_string()),
				file: None,
			},
			2_000,
		)
		.await
		.expect("append");
	id
}

fn draft(user_id: &str, text: &str) -> pb::MessageDraft {
	pb::MessageDraft {
		user_id: user_id.to_string(),
		user_name: "Resident".to_string(),
		user_profile_picture: None,
		text: Some(text.to_string()),
		file: None,
	}
}

/// Join a community and spawn an events loop feeding a channel.
async fn join_and_watch(
	addr: SocketAddr,
	community: &str,
	user_id: &str,
) -> (SessionControl, mpsc::UnboundedReceiver<pb::EventEnvelope>) {
	let (mut control, _welcome) = SessionControl::connect(client_config(addr)).await.expect("connect");
	control
		.join_community(community, user_id, &token_for(user_id))
		.await
		.expect("join");

	let mut events = control.open_events_stream().await.expect("open events stream");
	let (tx, rx) = mpsc::unbounded_channel();
	tokio::spawn(async move {
		let _ = events
			.run_events_loop(|ev| {
				let _ = tx.send(ev);
			})
			.await;
	});

	// Give the server's reconcile loop a beat to wire the room subscription.
	tokio::time::sleep(Duration::from_millis(300)).await;

	(control, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<pb::EventEnvelope>) -> pb::EventEnvelope {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out waiting for event")
		.expect("events channel closed")
}

#[tokio::test]
async fn handshake_and_ping_round_trip() {
	let server = start_server().await;

	let (mut control, welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	assert!(welcome.server_name.starts_with("homeroom-server/"));
	assert!(welcome.max_frame_bytes > 0);

	let pong = control.ping(1_234).await.expect("ping");
	assert_eq!(pong.client_time_unix_ms, 1_234);
	assert!(pong.server_time_unix_ms > 0);

	control.close(0, "done");
}

#[tokio::test]
async fn join_replays_history_in_append_order() {
	let server = start_server().await;
	let community = seed_community(&server.store, "c-history", true).await;
	seed_message(&server.store, &community, PLAIN_USER, "first").await;
	seed_message(&server.store, &community, PLAIN_USER, "second").await;
	seed_message(&server.store, &community, PLAIN_USER, "third").await;

	let (mut control, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	let existing = control
		.join_community("c-history", PLAIN_USER, &token_for(PLAIN_USER))
		.await
		.expect("join");

	let collection = existing.collection.expect("collection present");
	let texts: Vec<&str> = collection.messages.iter().filter_map(|m| m.text.as_deref()).collect();
	assert_eq!(texts, vec!["first", "second", "third"]);

	control.close(0, "done");
}

#[tokio::test]
async fn join_without_collection_is_empty_not_an_error() {
	let server = start_server().await;
	seed_community(&server.store, "c-bare", false).await;

	let (mut control, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	let existing = control
		.join_community("c-bare", PLAIN_USER, &token_for(PLAIN_USER))
		.await
		.expect("join");
	assert!(existing.collection.is_none());

	control.close(0, "done");
}

#[tokio::test]
async fn join_with_forged_token_is_rejected() {
	let server = start_server().await;
	seed_community(&server.store, "c-auth", true).await;

	let (mut control, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	let forged = mint_user_token(PLAIN_USER, "wrong-secret", Duration::from_secs(600));
	let err = control.join_community("c-auth", PLAIN_USER, &forged).await.unwrap_err();

	match err {
		homeroom_client_core::ClientCoreError::Rejected(notice) => {
			assert_eq!(notice.code, pb::code::NOT_AUTHENTICATED);
		}
		other => panic!("expected Rejected, got {other:?}"),
	}

	control.close(0, "done");
}

#[tokio::test]
async fn send_without_collection_notifies_sender_only() {
	let server = start_server().await;
	seed_community(&server.store, "c-nocoll", false).await;

	let (mut control, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	control
		.send_message("c-nocoll", &token_for(PLAIN_USER), draft(PLAIN_USER, "hello"))
		.await
		.expect("send");

	let notice = control.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::NOT_FOUND);
	assert_eq!(notice.community_id, "c-nocoll");

	control.close(0, "done");
}

#[tokio::test]
async fn send_broadcasts_to_joined_connections() {
	let server = start_server().await;
	seed_community(&server.store, "c-chat", true).await;

	let (_watcher, mut events) = join_and_watch(server.addr, "c-chat", COMMUNITY_ADMIN).await;

	let (mut sender, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	sender
		.send_message("c-chat", &token_for(PLAIN_USER), draft(PLAIN_USER, "evening all"))
		.await
		.expect("send");

	let ev = next_event(&mut events).await;
	assert_eq!(ev.community_id, "c-chat");
	match ev.event {
		Some(pb::event_envelope::Event::NewMessage(new_message)) => {
			let message = new_message.message.expect("message present");
			assert_eq!(message.text.as_deref(), Some("evening all"));
			assert_eq!(message.user_id, PLAIN_USER);
			assert!(!message.id.is_empty());
		}
		other => panic!("expected NewMessage, got {other:?}"),
	}

	sender.close(0, "done");
}

#[tokio::test]
async fn broadcasts_are_scoped_to_the_joined_community() {
	let server = start_server().await;
	seed_community(&server.store, "c-east", true).await;
	seed_community(&server.store, "c-west", true).await;

	let (_watcher, mut events) = join_and_watch(server.addr, "c-west", PLAIN_USER).await;

	let (mut sender, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	sender
		.send_message("c-east", &token_for(PLAIN_USER), draft(PLAIN_USER, "east only"))
		.await
		.expect("send");
	sender
		.send_message("c-west", &token_for(PLAIN_USER), draft(PLAIN_USER, "west only"))
		.await
		.expect("send");

	// The first (and only) event the west watcher sees is the west message.
	let ev = next_event(&mut events).await;
	assert_eq!(ev.community_id, "c-west");
	match ev.event {
		Some(pb::event_envelope::Event::NewMessage(new_message)) => {
			assert_eq!(new_message.message.expect("message").text.as_deref(), Some("west only"));
		}
		other => panic!("expected NewMessage, got {other:?}"),
	}

	sender.close(0, "done");
}

#[tokio::test]
async fn second_join_on_same_connection_receives_broadcasts() {
	let server = start_server().await;
	seed_community(&server.store, "c-north", true).await;
	seed_community(&server.store, "c-south", true).await;

	let (mut watcher, mut events) = join_and_watch(server.addr, "c-north", PLAIN_USER).await;

	// Same connection joins a second community after the events stream is
	// already live; its broadcasts must start flowing too.
	watcher
		.join_community("c-south", PLAIN_USER, &token_for(PLAIN_USER))
		.await
		.expect("second join");
	tokio::time::sleep(Duration::from_millis(300)).await;

	let (mut sender, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	sender
		.send_message("c-south", &token_for(PLAIN_USER), draft(PLAIN_USER, "south side"))
		.await
		.expect("send");

	let ev = next_event(&mut events).await;
	assert_eq!(ev.community_id, "c-south");
	match ev.event {
		Some(pb::event_envelope::Event::NewMessage(new_message)) => {
			assert_eq!(new_message.message.expect("message").text.as_deref(), Some("south side"));
		}
		other => panic!("expected NewMessage, got {other:?}"),
	}

	sender.close(0, "done");
	watcher.close(0, "done");
}

#[tokio::test]
async fn malformed_community_id_is_not_found() {
	let server = start_server().await;

	let (mut control, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	control
		.send_message("   ", &token_for(PLAIN_USER), draft(PLAIN_USER, "hello"))
		.await
		.expect("send");

	// An id that cannot name any community is a lookup miss, not a state
	// collision.
	let notice = control.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::NOT_FOUND);

	control.close(0, "done");
}

#[tokio::test]
async fn delete_is_platform_admin_only() {
	let server = start_server().await;
	let community = seed_community(&server.store, "c-del", true).await;
	let message_id = seed_message(&server.store, &community, PLAIN_USER, "remove me").await;

	let (_watcher, mut events) = join_and_watch(server.addr, "c-del", PLAIN_USER).await;

	// A community admin is still not allowed to delete.
	let (mut lead, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	lead.delete_message("c-del", &message_id.to_string(), COMMUNITY_ADMIN, &token_for(COMMUNITY_ADMIN))
		.await
		.expect("send delete");
	let notice = lead.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::NOT_AUTHORIZED);

	let (mut admin, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	admin
		.delete_message("c-del", &message_id.to_string(), ADMIN_USER, &token_for(ADMIN_USER))
		.await
		.expect("send delete");

	let ev = next_event(&mut events).await;
	match ev.event {
		Some(pb::event_envelope::Event::MessageDeleted(deleted)) => {
			assert_eq!(deleted.message_id, message_id.to_string());
		}
		other => panic!("expected MessageDeleted, got {other:?}"),
	}

	lead.close(0, "done");
	admin.close(0, "done");
}

#[tokio::test]
async fn flag_broadcasts_and_duplicate_flag_conflicts() {
	let server = start_server().await;
	let community = seed_community(&server.store, "c-flag", true).await;
	let message_id = seed_message(&server.store, &community, PLAIN_USER, "rude").await;

	let (mut lead, mut events) = join_and_watch(server.addr, "c-flag", COMMUNITY_ADMIN).await;

	let report = pb::ReportDraft {
		group_name: "Maple Grove".to_string(),
		message: "rude".to_string(),
		reported_by: COMMUNITY_ADMIN.to_string(),
		message_by: PLAIN_USER.to_string(),
	};

	lead.flag_message(
		"c-flag",
		&message_id.to_string(),
		COMMUNITY_ADMIN,
		&token_for(COMMUNITY_ADMIN),
		report.clone(),
	)
	.await
	.expect("send flag");

	let ev = next_event(&mut events).await;
	match ev.event {
		Some(pb::event_envelope::Event::MessageFlagged(flagged)) => {
			assert_eq!(flagged.message_id, message_id.to_string());
			assert!(flagged.flagged);
		}
		other => panic!("expected MessageFlagged, got {other:?}"),
	}

	// Second flag loses the compare-and-set: conflict notice, no broadcast.
	lead.flag_message(
		"c-flag",
		&message_id.to_string(),
		COMMUNITY_ADMIN,
		&token_for(COMMUNITY_ADMIN),
		report,
	)
	.await
	.expect("send flag");
	let notice = lead.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::CONFLICT);

	lead.close(0, "done");
}

#[tokio::test]
async fn plain_members_cannot_flag() {
	let server = start_server().await;
	let community = seed_community(&server.store, "c-noflag", true).await;
	let message_id = seed_message(&server.store, &community, COMMUNITY_ADMIN, "fine message").await;

	let (mut resident, _welcome) = SessionControl::connect(client_config(server.addr)).await.expect("connect");
	resident
		.flag_message(
			"c-noflag",
			&message_id.to_string(),
			PLAIN_USER,
			&token_for(PLAIN_USER),
			pb::ReportDraft {
				group_name: "Maple Grove".to_string(),
				message: "fine message".to_string(),
				reported_by: PLAIN_USER.to_string(),
				message_by: COMMUNITY_ADMIN.to_string(),
			},
		)
		.await
		.expect("send flag");

	let notice = resident.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::NOT_AUTHORIZED);

	resident.close(0, "done");
}

#[tokio::test]
async fn unflag_broadcasts_and_double_unflag_conflicts() {
	let server = start_server().await;
	let community = seed_community(&server.store, "c-unflag", true).await;
	let message_id = seed_message(&server.store, &community, PLAIN_USER, "rude").await;
	server
		.store
		.flag_message(
			&community,
			&message_id,
			&homeroom_domain::ReportDraft {
				group_name: "Maple Grove".to_string(),
				message: "rude".to_string(),
				reported_by: UserId::new(COMMUNITY_ADMIN).expect("id"),
				message_by: UserId::new(PLAIN_USER).expect("id"),
			},
			3_000,
		)
		.await
		.expect("flag");

	let (mut lead, mut events) = join_and_watch(server.addr, "c-unflag", COMMUNITY_ADMIN).await;

	lead.unflag_message("c-unflag", &message_id.to_string(), COMMUNITY_ADMIN, &token_for(COMMUNITY_ADMIN))
		.await
		.expect("send unflag");

	let ev = next_event(&mut events).await;
	match ev.event {
		Some(pb::event_envelope::Event::MessageUnflagged(unflagged)) => {
			assert_eq!(unflagged.message_id, message_id.to_string());
			assert!(!unflagged.flagged);
		}
		other => panic!("expected MessageUnflagged, got {other:?}"),
	}

	// Already unflagged: the compare-and-set fails, sender gets a conflict
	// and nothing is broadcast.
	lead.unflag_message("c-unflag", &message_id.to_string(), COMMUNITY_ADMIN, &token_for(COMMUNITY_ADMIN))
		.await
		.expect("send unflag");
	let notice = lead.recv_error_notice().await.expect("error notice");
	assert_eq!(notice.code, pb::code::CONFLICT);

	lead.close(0, "done");
}
