#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, anyhow};
use homeroom_client_core::{ClientConfigV1, SessionControl};
use homeroom_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use homeroom_protocol::pb;
use quinn::{Endpoint, ServerConfig};
use tokio::sync::{RwLock, mpsc, oneshot};

const PROTOCOL_VERSION: u32 = 1;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("HOMEROOM_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

#[derive(Debug, Default)]
struct GlobalState {
	joined: bool,
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

fn make_quic_server(bind_addr: SocketAddr) -> anyhow::Result<(Endpoint, Vec<u8>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_der = ck.cert.der().to_vec();
	let key_der = ck.signing_key.serialize_der();

	let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der.clone())];
	let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
		.map_err(anyhow::Error::msg)
		.context("parse private key der")?;

	let mut tls_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![b"homeroom-v1".to_vec()];

	let server_config = ServerConfig::with_crypto(Arc::new(quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?));
	let endpoint = Endpoint::server(server_config, bind_addr).context("bind quinn endpoint")?;

	Ok((endpoint, cert_der))
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

/// Scripted server: handshake, one join with a canned history reply, then a
/// single `NewMessage` broadcast on the events stream.
async fn run_minimal_server(
	endpoint: Endpoint,
	state: Arc<RwLock<GlobalState>>,
	ready_tx: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<()> {
	init_test_logging();

	let local_addr = endpoint.local_addr().context("server local_addr")?;
	tracing::info!(?local_addr, "server: endpoint bound");
	let _ = ready_tx.send(local_addr);

	let Some(connecting) = endpoint.accept().await else {
		return Err(anyhow!("server endpoint closed before accept"));
	};

	let connection = connecting.await.context("accept quic connection")?;
	tracing::info!(remote = %connection.remote_address(), "server: accepted QUIC connection");

	let (mut control_send, mut control_recv) = connection.accept_bi().await.context("accept_bi (control)")?;

	let (tx, mut rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader = tokio::spawn(async move {
		let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control read failed")),
			};
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match homeroom_protocol::decode_frame::<pb::Envelope>(&buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok((env, used)) => {
						buf.drain(0..used);
						if tx.send(env).is_err() {
							return Ok(());
						}
					}
					Err(homeroom_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => return Err(anyhow!(e).context("decode control frame failed")),
				}
			}
		}
	});

	let _hello = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no Hello received"))?;
		match env.msg {
			Some(pb::envelope::Msg::Hello(h)) => break h,
			_ => continue,
		}
	};
	tracing::info!("server: received Hello");

	send_envelope(
		&mut control_send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Welcome(pb::Welcome {
				server_name: "homeroom-server-test".to_string(),
				server_instance_id: "test-instance".to_string(),
				server_time_unix_ms: unix_ms_now(),
				max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			})),
		},
	)
	.await
	.context("send Welcome")?;

	let (events_tx, events_rx) = oneshot::channel::<anyhow::Result<(quinn::SendStream, quinn::RecvStream)>>();
	let events_accept_task = tokio::spawn(async move {
		let res = connection.accept_bi().await.context("accept_bi (events)");
		let _ = events_tx.send(res);
		Ok::<(), anyhow::Error>(())
	});

	let joined_community = loop {
		let env = rx.recv().await.ok_or_else(|| anyhow!("no JoinCommunity received"))?;
		match env.msg {
			Some(pb::envelope::Msg::JoinCommunity(join)) => {
				{
					let mut st = state.write().await;
					st.joined = true;
				}

				send_envelope(
					&mut control_send,
					pb::Envelope {
						version: PROTOCOL_VERSION,
						request_id: env.request_id,
						msg: Some(pb::envelope::Msg::ExistingMessages(pb::ExistingMessages {
							community_id: join.community_id.clone(),
							collection: Some(pb::MessageCollection {
								community_id: join.community_id.clone(),
								messages: vec![pb::ChatMessage {
									id: "11111111-1111-1111-1111-111111111111".to_string(),
									user_id: "u-1".to_string(),
									user_name: "Earlier Resident".to_string(),
									user_profile_picture: None,
									text: Some("welcome to the community".to_string()),
									file: None,
									flagged: false,
									created_at_unix_ms: unix_ms_now(),
								}],
							}),
						})),
					},
				)
				.await
				.context("send ExistingMessages")?;

				tracing::info!(community_id = %join.community_id, "server: processed join");
				break join.community_id;
			}
			_ => continue,
		}
	};

	let (mut events_send, _events_recv) = match events_rx.await {
		Ok(Ok((send, recv))) => (send, recv),
		Ok(Err(e)) => {
			return Err(e).context("failed to accept events stream (background accept task)");
		}
		Err(_) => {
			return Err(anyhow!(
				"events stream accept task dropped (likely connection closed before server observed events stream)"
			));
		}
	};
	tracing::info!("server: accepted events bidirectional stream");

	let event = pb::EventEnvelope {
		community_id: joined_community.clone(),
		server_time_unix_ms: unix_ms_now(),
		event: Some(pb::event_envelope::Event::NewMessage(pb::NewMessageEvent {
			community_id: joined_community,
			message: Some(pb::ChatMessage {
				id: "22222222-2222-2222-2222-222222222222".to_string(),
				user_id: "u-2".to_string(),
				user_name: "Neighbour".to_string(),
				user_profile_picture: None,
				text: Some("synthetic smoke-test message".to_string()),
				file: None,
				flagged: false,
				created_at_unix_ms: unix_ms_now(),
			}),
		})),
	};

	send_envelope(
		&mut events_send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Event(event)),
		},
	)
	.await
	.context("send event")?;
	tracing::info!("server: sent synthetic event");

	let _ = events_send.finish();

	events_accept_task.await??;

	match reader.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			tracing::debug!(error = %e, "server: control reader ended (expected during shutdown)");
		}
		Err(join_err) => {
			tracing::debug!(error = %join_err, "server: control reader task join error (ignored in smoke test)");
		}
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_smoke_client_joins_and_receives_broadcast() -> anyhow::Result<()> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let (endpoint, _cert_der) = make_quic_server(bind_addr)?;

	let state = Arc::new(RwLock::new(GlobalState::default()));
	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();

	let server_state = Arc::clone(&state);
	let server_task = tokio::spawn(async move { run_minimal_server(endpoint, server_state, ready_tx).await });

	let mut server_addr = ready_rx.await.context("server ready")?;

	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let cfg = ClientConfigV1 {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		client_name: "homeroom-test-client".to_string(),
		client_instance_id: "test-instance".to_string(),
		..ClientConfigV1::default()
	};

	let (mut control, welcome) = SessionControl::connect(cfg).await.context("client connect")?;
	assert_eq!(welcome.server_name, "homeroom-server-test");

	let existing = control
		.join_community("c-demo", "u-9", "v1.payload.sig")
		.await
		.context("join community")?;
	assert_eq!(existing.community_id, "c-demo");
	let replayed = existing.collection.expect("collection present");
	assert_eq!(replayed.messages.len(), 1);
	assert_eq!(replayed.messages[0].text.as_deref(), Some("welcome to the community"));

	let mut events = control.open_events_stream().await.context("open events stream")?;

	let (got_tx, got_rx) = oneshot::channel::<pb::EventEnvelope>();

	let mut sent = Some(got_tx);
	let session_task = tokio::spawn(async move {
		events
			.run_events_loop(|ev| {
				if let Some(tx) = sent.take() {
					let _ = tx.send(ev);
				}
			})
			.await
	});

	let ev = tokio::time::timeout(Duration::from_secs(5), got_rx)
		.await
		.context("timeout waiting for event")?
		.context("event channel closed")?;

	assert_eq!(ev.community_id, "c-demo");
	match ev.event {
		Some(pb::event_envelope::Event::NewMessage(new_message)) => {
			let msg = new_message.message.expect("chat message is present");
			assert_eq!(msg.user_name, "Neighbour");
			assert_eq!(msg.text.as_deref(), Some("synthetic smoke-test message"));
		}
		other => panic!("expected NewMessage event, got: {other:?}"),
	}

	{
		let st = state.read().await;
		assert!(st.joined, "server should have processed the join");
	}

	session_task.abort();
	let _ = session_task.await;

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}
