#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use homeroom_domain::{CommunityId, MessageDraft, MessageId, ReportDraft, SecretString, UserId};
use homeroom_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use homeroom_protocol::{convert, pb};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::server::action::ActionError;
use crate::server::auth::verify_user_token;
use crate::server::moderation;
use crate::server::room_hub::{RoomHub, RoomHubItem};
use crate::server::state::GlobalState;
use crate::server::store::{Store, UnflagOutcome};
use crate::util::time::unix_ms_now;

/// v1 protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	pub fan_in_channel_capacity: usize,

	pub auth_hmac_secret: Option<SecretString>,

	/// Origins allowed to connect; empty means no restriction.
	pub allowed_origins: Vec<String>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			fan_in_channel_capacity: 1024,
			auth_hmac_secret: None,
			allowed_origins: Vec::new(),
		}
	}
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	state: Arc<RwLock<GlobalState>>,
	room_hub: RoomHub,
	store: Arc<Store>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("homeroom_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("homeroom_server_connections_total").increment(1);
	metrics::gauge!("homeroom_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("homeroom_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match homeroom_protocol::decode_frame::<pb::Envelope>(&buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("homeroom_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(homeroom_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("homeroom_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let hello = wait_for_hello(&mut ctrl_rx).await?;

	info!(
		conn_id,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		origin = %hello.origin,
		"received Hello"
	);
	metrics::counter!("homeroom_server_hello_total").increment(1);

	if !settings.allowed_origins.is_empty() {
		let origin = hello.origin.trim();
		if !settings.allowed_origins.iter().any(|allowed| allowed == origin) {
			warn!(conn_id, origin = %hello.origin, "origin not in allow-list");
			send_error_notice(
				&mut control_send,
				String::new(),
				pb::code::NOT_AUTHORIZED,
				"origin not allowed",
				String::new(),
			)
			.await
			.ok();
			return Ok(());
		}
	}

	let welcome = pb::Welcome {
		server_name: format!("homeroom-server/{}", env!("CARGO_PKG_VERSION")),
		server_instance_id: format!("conn-{conn_id}"),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
	};

	send_envelope(
		&mut control_send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Welcome(welcome)),
		},
	)
	.await
	.context("send Welcome")?;

	// The events stream is client-opened and accepted lazily after the first
	// successful join, so the handshake never blocks on it.
	let events_send: Arc<Mutex<Option<quinn::SendStream>>> = Arc::new(Mutex::new(None));

	// Joins on the control loop wake the events task so it re-reads the
	// membership instead of staying parked on already-subscribed rooms.
	let membership_changed = Arc::new(Notify::new());

	let room_hub_for_events = room_hub.clone();
	let state_for_events = Arc::clone(&state);
	let events_send_for_task = Arc::clone(&events_send);
	let membership_changed_for_task = Arc::clone(&membership_changed);
	let fan_in_capacity = settings.fan_in_channel_capacity;

	let events_task = tokio::spawn(async move {
		let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<(String, RoomHubItem)>(fan_in_capacity);

		let mut room_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

		async fn ensure_room_task(
			community: &str,
			room_hub: &RoomHub,
			fan_in_tx: &mpsc::Sender<(String, RoomHubItem)>,
			room_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
		) {
			if room_tasks.contains_key(community) {
				return;
			}

			let id = match CommunityId::new(community) {
				Ok(id) => id,
				Err(_) => return,
			};
			let mut rx = room_hub.subscribe_community(id).await;

			let community_s = community.to_string();
			let tx = fan_in_tx.clone();

			let handle = tokio::spawn(async move {
				while let Some(item) = rx.recv().await {
					if tx.send((community_s.clone(), item)).await.is_err() {
						break;
					}
				}
			});

			room_tasks.insert(community.to_string(), handle);
		}

		async fn reconcile_room_tasks(
			conn_id: u64,
			state: &Arc<RwLock<GlobalState>>,
			room_hub: &RoomHub,
			fan_in_tx: &mpsc::Sender<(String, RoomHubItem)>,
			room_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
		) -> HashSet<String> {
			let communities: HashSet<String> = {
				let st = state.read().await;
				st.communities_for_conn(conn_id)
			};

			for community in communities.iter() {
				ensure_room_task(community, room_hub, fan_in_tx, room_tasks).await;
			}

			room_tasks.retain(|community, handle| {
				if communities.contains(community) {
					true
				} else {
					handle.abort();
					false
				}
			});

			communities
		}

		let mut current_communities =
			reconcile_room_tasks(conn_id, &state_for_events, &room_hub_for_events, &fan_in_tx, &mut room_tasks).await;

		loop {
			if current_communities.is_empty() {
				tokio::select! {
					_ = membership_changed_for_task.notified() => {}
					_ = tokio::time::sleep(std::time::Duration::from_millis(25)) => {}
				}
				current_communities =
					reconcile_room_tasks(conn_id, &state_for_events, &room_hub_for_events, &fan_in_tx, &mut room_tasks)
						.await;
				continue;
			}

			let (community, item) = tokio::select! {
				_ = membership_changed_for_task.notified() => {
					current_communities = reconcile_room_tasks(
						conn_id,
						&state_for_events,
						&room_hub_for_events,
						&fan_in_tx,
						&mut room_tasks,
					)
					.await;
					continue;
				}
				received = fan_in_rx.recv() => match received {
					Some(v) => v,
					None => return Ok::<(), anyhow::Error>(()),
				},
			};

			if !current_communities.contains(&community) {
				continue;
			}

			let mut guard = events_send_for_task.lock().await;
			let Some(events_send) = guard.as_mut() else {
				// Joined but no events stream yet; the join reply already
				// carried the full history, so drop rather than buffer.
				continue;
			};

			match item {
				RoomHubItem::Event(env) => {
					let frame = match encode_frame(
						&pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: String::new(),
							msg: Some(pb::envelope::Msg::Event(*env)),
						},
						DEFAULT_MAX_FRAME_SIZE,
					) {
						Ok(f) => f,
						Err(e) => {
							error!(conn_id, error = %e, "failed to encode event frame");
							return Err::<(), anyhow::Error>(anyhow!(e));
						}
					};

					metrics::counter!("homeroom_server_events_out_total").increment(1);
					debug!(conn_id, community = %community, frame_len = frame.len(), "writing event frame");

					if let Err(e) = events_send.write_all(&frame).await {
						return Err(anyhow!(e).context("events stream write failed"));
					}
				}
				RoomHubItem::Lagged { dropped } => {
					metrics::counter!("homeroom_server_events_lagged_total").increment(dropped);
					warn!(
						conn_id,
						community = %community,
						dropped,
						"community subscription lagged; events were dropped"
					);
				}
			}

			current_communities =
				reconcile_room_tasks(conn_id, &state_for_events, &room_hub_for_events, &fan_in_tx, &mut room_tasks).await;
		}
	});

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let Some(msg) = env.msg else { continue };

			match msg {
				pb::envelope::Msg::Ping(ping) => {
					let pong = pb::Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					};

					send_envelope(
						&mut control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::Pong(pong)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::JoinCommunity(join) => {
					if !verify_user_token(&join.user_token, &join.user_id, settings.auth_hmac_secret.as_ref()) {
						warn!(conn_id, user_id = %join.user_id, "join rejected: invalid user token");
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::NOT_AUTHENTICATED,
							"invalid user token",
							String::new(),
						)
						.await?;
						continue;
					}

					let community = match CommunityId::new(&join.community_id) {
						Ok(id) => id,
						Err(e) => {
							send_error_notice(
								&mut control_send,
								env.request_id,
								pb::code::NOT_FOUND,
								&format!("invalid community id: {e}"),
								join.community_id,
							)
							.await?;
							continue;
						}
					};

					// A community without a collection is still joinable; the
					// reply just carries no history.
					let messages = match store.fetch_collection(&community).await {
						Ok(messages) => messages,
						Err(e) => {
							notify_action_failed(&mut control_send, env.request_id, community.to_string(), &e.into())
								.await?;
							continue;
						}
					};

					{
						let mut st = state.write().await;
						st.join_community(conn_id, community.as_str());
					}
					membership_changed.notify_one();
					metrics::counter!("homeroom_server_joins_total").increment(1);
					info!(conn_id, community = %community, user_id = %join.user_id, "joined community");

					let reply = convert::collection_envelope(&community, messages);
					send_envelope(
						&mut control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::ExistingMessages(reply)),
						},
					)
					.await?;

					let mut guard = events_send.lock().await;
					if guard.is_none() {
						info!(conn_id, "waiting to accept events bidirectional stream (client-opened; after join)");
						let (send, _recv) = connection.accept_bi().await.context("accept events bidirectional stream")?;
						info!(conn_id, "accepted events bidirectional stream (server will only write)");
						*guard = Some(send);
					}
				}

				pb::envelope::Msg::SendMessage(send) => {
					let Some(draft) = send.message else {
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::CONFLICT,
							"send carries no message",
							send.community_id,
						)
						.await?;
						continue;
					};

					if !verify_user_token(&send.user_token, &draft.user_id, settings.auth_hmac_secret.as_ref()) {
						warn!(conn_id, user_id = %draft.user_id, "send rejected: invalid user token");
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::NOT_AUTHENTICATED,
							"invalid user token",
							send.community_id,
						)
						.await?;
						continue;
					}

					let community = match CommunityId::new(&send.community_id) {
						Ok(id) => id,
						Err(e) => {
							send_error_notice(
								&mut control_send,
								env.request_id,
								pb::code::NOT_FOUND,
								&format!("invalid community id: {e}"),
								send.community_id,
							)
							.await?;
							continue;
						}
					};

					let draft = match MessageDraft::try_from(draft) {
						Ok(d) => d,
						Err(e) => {
							send_error_notice(
								&mut control_send,
								env.request_id,
								pb::code::CONFLICT,
								&format!("invalid message: {e}"),
								community.to_string(),
							)
							.await?;
							continue;
						}
					};

					match store.append_message(&community, MessageId::new_v4(), &draft, unix_ms_now()).await {
						Ok(stored) => {
							metrics::counter!("homeroom_server_messages_total").increment(1);

							let event = pb::EventEnvelope {
								community_id: community.to_string(),
								server_time_unix_ms: unix_ms_now(),
								event: Some(pb::event_envelope::Event::NewMessage(pb::NewMessageEvent {
									community_id: community.to_string(),
									message: Some(stored.into()),
								})),
							};
							room_hub.publish_event(&community, event).await;
						}
						Err(e) => {
							notify_action_failed(&mut control_send, env.request_id, community.to_string(), &e.into())
								.await?;
						}
					}
				}

				pb::envelope::Msg::DeleteMessage(del) => {
					if !verify_user_token(&del.user_token, &del.user_id, settings.auth_hmac_secret.as_ref()) {
						warn!(conn_id, user_id = %del.user_id, "delete rejected: invalid user token");
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::NOT_AUTHENTICATED,
							"invalid user token",
							del.community_id,
						)
						.await?;
						continue;
					}

					let (community, message_id, user) =
						match parse_moderation_target(&del.community_id, &del.message_id, &del.user_id) {
							Ok(parts) => parts,
							Err(e) => {
								send_error_notice(
									&mut control_send,
									env.request_id,
									pb::code::NOT_FOUND,
									&e,
									del.community_id,
								)
								.await?;
								continue;
							}
						};

					match moderation::delete_message(&store, &community, &message_id, &user).await {
						Ok(()) => {
							metrics::counter!("homeroom_server_deletes_total").increment(1);

							let event = pb::EventEnvelope {
								community_id: community.to_string(),
								server_time_unix_ms: unix_ms_now(),
								event: Some(pb::event_envelope::Event::MessageDeleted(pb::MessageDeletedEvent {
									community_id: community.to_string(),
									message_id: message_id.to_string(),
								})),
							};
							room_hub.publish_event(&community, event).await;
						}
						Err(e) => {
							notify_action_failed(&mut control_send, env.request_id, community.to_string(), &e).await?;
						}
					}
				}

				pb::envelope::Msg::FlagMessage(flag) => {
					if !verify_user_token(&flag.user_token, &flag.user_id, settings.auth_hmac_secret.as_ref()) {
						warn!(conn_id, user_id = %flag.user_id, "flag rejected: invalid user token");
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::NOT_AUTHENTICATED,
							"invalid user token",
							flag.community_id,
						)
						.await?;
						continue;
					}

					let (community, message_id, user) =
						match parse_moderation_target(&flag.community_id, &flag.message_id, &flag.user_id) {
							Ok(parts) => parts,
							Err(e) => {
								send_error_notice(
									&mut control_send,
									env.request_id,
									pb::code::NOT_FOUND,
									&e,
									flag.community_id,
								)
								.await?;
								continue;
							}
						};

					let report = match flag.report.map(ReportDraft::try_from) {
						Some(Ok(report)) => report,
						Some(Err(e)) => {
							send_error_notice(
								&mut control_send,
								env.request_id,
								pb::code::CONFLICT,
								&format!("invalid report: {e}"),
								community.to_string(),
							)
							.await?;
							continue;
						}
						None => {
							send_error_notice(
								&mut control_send,
								env.request_id,
								pb::code::CONFLICT,
								"flag carries no report",
								community.to_string(),
							)
							.await?;
							continue;
						}
					};

					match moderation::flag_message(&store, &community, &message_id, &user, &report).await {
						Ok(()) => {
							metrics::counter!("homeroom_server_flags_total").increment(1);

							let event = pb::EventEnvelope {
								community_id: community.to_string(),
								server_time_unix_ms: unix_ms_now(),
								event: Some(pb::event_envelope::Event::MessageFlagged(pb::MessageFlaggedEvent {
									community_id: community.to_string(),
									message_id: message_id.to_string(),
									flagged: true,
								})),
							};
							room_hub.publish_event(&community, event).await;
						}
						Err(e) => {
							notify_action_failed(&mut control_send, env.request_id, community.to_string(), &e).await?;
						}
					}
				}

				pb::envelope::Msg::UnflagMessage(unflag) => {
					if !verify_user_token(&unflag.user_token, &unflag.user_id, settings.auth_hmac_secret.as_ref()) {
						warn!(conn_id, user_id = %unflag.user_id, "unflag rejected: invalid user token");
						send_error_notice(
							&mut control_send,
							env.request_id,
							pb::code::NOT_AUTHENTICATED,
							"invalid user token",
							unflag.community_id,
						)
						.await?;
						continue;
					}

					let (community, message_id, user) =
						match parse_moderation_target(&unflag.community_id, &unflag.message_id, &unflag.user_id) {
							Ok(parts) => parts,
							Err(e) => {
								send_error_notice(
									&mut control_send,
									env.request_id,
									pb::code::NOT_FOUND,
									&e,
									unflag.community_id,
								)
								.await?;
								continue;
							}
						};

					match moderation::unflag_message(&store, &community, &message_id, &user).await {
						Ok(outcome) => {
							metrics::counter!("homeroom_server_unflags_total").increment(1);

							let event = pb::EventEnvelope {
								community_id: community.to_string(),
								server_time_unix_ms: unix_ms_now(),
								event: Some(pb::event_envelope::Event::MessageUnflagged(pb::MessageUnflaggedEvent {
									community_id: community.to_string(),
									message_id: message_id.to_string(),
									flagged: false,
								})),
							};
							room_hub.publish_event(&community, event).await;

							// The flag reversal committed either way; a missing
							// report only concerns the caller.
							if outcome == UnflagOutcome::ReportMissing {
								send_error_notice(
									&mut control_send,
									env.request_id,
									pb::code::CONFLICT,
									"no report on file for message",
									community.to_string(),
								)
								.await?;
							}
						}
						Err(e) => {
							notify_action_failed(&mut control_send, env.request_id, community.to_string(), &e).await?;
						}
					}
				}

				pb::envelope::Msg::Hello(_) => {
					debug!(conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id, "unhandled control message: {:?}", message_kind(&other));
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	{
		let mut st = state.write().await;
		let left = st.remove_conn(conn_id);
		debug!(conn_id, communities = ?left, "connection closing, membership removed");
	}

	let _ = reader_task.await;
	events_task.abort();
	let _ = events_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

fn parse_moderation_target(
	community_id: &str,
	message_id: &str,
	user_id: &str,
) -> Result<(CommunityId, MessageId, UserId), String> {
	let community = CommunityId::new(community_id).map_err(|e| format!("invalid community id: {e}"))?;
	let message = MessageId::parse(message_id).map_err(|e| format!("invalid message id: {e}"))?;
	let user = UserId::new(user_id).map_err(|e| format!("invalid user id: {e}"))?;
	Ok((community, message, user))
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("homeroom_server_envelopes_out_total").increment(1);
	metrics::counter!("homeroom_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

async fn send_error_notice(
	send: &mut quinn::SendStream,
	request_id: String,
	code: &str,
	message: &str,
	community_id: String,
) -> anyhow::Result<()> {
	send_envelope(
		send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id,
			msg: Some(pb::envelope::Msg::Error(pb::ErrorNotice {
				code: code.to_string(),
				message: message.to_string(),
				community_id,
			})),
		},
	)
	.await
}

async fn notify_action_failed(
	send: &mut quinn::SendStream,
	request_id: String,
	community_id: String,
	err: &ActionError,
) -> anyhow::Result<()> {
	if let ActionError::Internal(cause) = err {
		error!(community_id = %community_id, error = %cause, "action failed");
	}
	send_error_notice(send, request_id, err.code(), &err.public_message(), community_id).await
}

fn message_kind(msg: &pb::envelope::Msg) -> &'static str {
	match msg {
		pb::envelope::Msg::Hello(_) => "Hello",
		pb::envelope::Msg::Welcome(_) => "Welcome",
		pb::envelope::Msg::Ping(_) => "Ping",
		pb::envelope::Msg::Pong(_) => "Pong",
		pb::envelope::Msg::JoinCommunity(_) => "JoinCommunity",
		pb::envelope::Msg::ExistingMessages(_) => "ExistingMessages",
		pb::envelope::Msg::SendMessage(_) => "SendMessage",
		pb::envelope::Msg::DeleteMessage(_) => "DeleteMessage",
		pb::envelope::Msg::FlagMessage(_) => "FlagMessage",
		pb::envelope::Msg::UnflagMessage(_) => "UnflagMessage",
		pb::envelope::Msg::Error(_) => "Error",
		pb::envelope::Msg::Event(_) => "Event",
	}
}
