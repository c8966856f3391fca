#![forbid(unsafe_code)]

//! Management REST surface for community, collection and report upkeep.
//!
//! Chat traffic stays on QUIC; these routes exist for the provisioning and
//! moderation dashboards. Callers authenticate with `Authorization: Bearer`
//! plus a `userId` query parameter, checked against the same HMAC tokens the
//! chat handshake uses.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use homeroom_domain::{Community, CommunityId, MessageId, ReportDraft, RosterEntry, SecretString, UserId};

use super::action::ActionError;
use super::auth::verify_user_token;
use super::moderation;
use super::store::{Store, UnflagOutcome};
use crate::util::time::unix_ms_now;

#[derive(Clone)]
pub struct RestState {
	pub store: Arc<Store>,
	pub auth_hmac_secret: Option<SecretString>,
}

enum RestError {
	BadRequest(String),
	Action(ActionError),
}

impl From<ActionError> for RestError {
	fn from(err: ActionError) -> Self {
		Self::Action(err)
	}
}

impl From<super::store::StoreError> for RestError {
	fn from(err: super::store::StoreError) -> Self {
		Self::Action(err.into())
	}
}

impl RestError {
	fn status(&self) -> StatusCode {
		match self {
			Self::BadRequest(_) => StatusCode::BAD_REQUEST,
			Self::Action(ActionError::NotAuthenticated) => StatusCode::UNAUTHORIZED,
			Self::Action(ActionError::NotAuthorized(_)) => StatusCode::FORBIDDEN,
			Self::Action(ActionError::NotFound(_)) => StatusCode::NOT_FOUND,
			Self::Action(ActionError::Conflict(_)) => StatusCode::CONFLICT,
			Self::Action(ActionError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn code(&self) -> &'static str {
		match self {
			Self::BadRequest(_) => "BAD_REQUEST",
			Self::Action(err) => err.code(),
		}
	}

	fn public_message(&self) -> String {
		match self {
			Self::BadRequest(msg) => msg.clone(),
			Self::Action(err) => err.public_message(),
		}
	}
}

pub fn spawn_rest_server(bind: SocketAddr, state: RestState) {
	tokio::spawn(async move {
		if let Err(err) = serve(bind, state).await {
			warn!(error = %err, "rest server stopped");
		}
	});
}

async fn serve(bind: SocketAddr, state: RestState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| {
				let state = state.clone();
				async move { Ok::<_, std::convert::Infallible>(handle_request(req, state).await) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "rest connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: RestState) -> Response<Full<Bytes>> {
	match route(req, &state).await {
		Ok((status, data)) => json_response(status, json!({ "success": true, "data": data })),
		Err(err) => {
			if let RestError::Action(ActionError::Internal(cause)) = &err {
				tracing::error!(error = %cause, "rest request failed");
			}
			json_response(
				err.status(),
				json!({
					"success": false,
					"error": { "code": err.code(), "message": err.public_message() },
				}),
			)
		}
	}
}

async fn route(req: Request<Incoming>, state: &RestState) -> Result<(StatusCode, serde_json::Value), RestError> {
	let caller = authenticate(&req, state.auth_hmac_secret.as_ref())?;
	let method = req.method().clone();
	let path = req.uri().path().trim_matches('/').to_string();

	let body = req
		.into_body()
		.collect()
		.await
		.map_err(|e| RestError::Action(ActionError::Internal(anyhow::anyhow!("read body: {e}"))))?
		.to_bytes();

	let segments: Vec<&str> = path.split('/').collect();
	let store = state.store.as_ref();

	match (method, segments.as_slice()) {
		(Method::POST, ["api", "communities"]) => {
			require_platform_admin(&caller)?;
			let community: Community = parse_body(&body)?;
			store.create_community(&community, unix_ms_now()).await?;
			Ok((StatusCode::CREATED, json!(community.id)))
		}
		(Method::GET, ["api", "communities"]) => {
			let communities = store.list_communities().await?;
			Ok((StatusCode::OK, json!(communities)))
		}
		(Method::GET, ["api", "communities", id]) => {
			let community = store.fetch_community(&community_id(id)?).await?;
			Ok((StatusCode::OK, json!(community)))
		}
		(Method::DELETE, ["api", "communities", id]) => {
			require_platform_admin(&caller)?;
			let id = community_id(id)?;
			store.delete_community(&id).await?;
			Ok((StatusCode::OK, json!(id)))
		}
		(Method::POST, ["api", "communities", id, "members"]) => {
			require_platform_admin(&caller)?;
			let entry: RosterEntry = parse_body(&body)?;
			store.add_member(&community_id(id)?, &entry).await?;
			Ok((StatusCode::CREATED, json!(entry.user_id)))
		}
		(Method::DELETE, ["api", "communities", id, "members", uid]) => {
			require_platform_admin(&caller)?;
			store.remove_member(&community_id(id)?, &user_id(uid)?).await?;
			Ok((StatusCode::OK, json!(uid)))
		}
		(Method::POST, ["api", "communities", id, "members", uid, "toggle-admin"]) => {
			require_platform_admin(&caller)?;
			let is_admin = store.toggle_member_admin(&community_id(id)?, &user_id(uid)?).await?;
			Ok((StatusCode::OK, json!({ "isAdmin": is_admin })))
		}
		(Method::POST, ["api", "messages", cid]) => {
			require_platform_admin(&caller)?;
			let cid = community_id(cid)?;
			store.create_collection(&cid, unix_ms_now()).await?;
			Ok((StatusCode::CREATED, json!(cid)))
		}
		(Method::GET, ["api", "messages", cid]) => {
			let cid = community_id(cid)?;
			match store.fetch_collection(&cid).await? {
				Some(messages) => Ok((StatusCode::OK, json!(messages))),
				None => Err(ActionError::NotFound(format!("no message collection for community: {cid}")).into()),
			}
		}
		(Method::DELETE, ["api", "messages", cid]) => {
			require_platform_admin(&caller)?;
			let cid = community_id(cid)?;
			store.delete_collection(&cid).await?;
			Ok((StatusCode::OK, json!(cid)))
		}
		(Method::GET, ["api", "messages", cid, mid]) => {
			let message = store.fetch_message(&community_id(cid)?, &message_id(mid)?).await?;
			Ok((StatusCode::OK, json!(message)))
		}
		(Method::DELETE, ["api", "messages", cid, mid]) => {
			let mid = message_id(mid)?;
			moderation::delete_message(store, &community_id(cid)?, &mid, &caller).await?;
			Ok((StatusCode::OK, json!(mid)))
		}
		(Method::POST, ["api", "messages", cid, mid, "toggle-flag"]) => {
			let cid = community_id(cid)?;
			let mid = message_id(mid)?;
			let flagged = toggle_flag(store, &cid, &mid, &caller, &body).await?;
			Ok((StatusCode::OK, json!({ "flagged": flagged })))
		}
		(Method::GET, ["api", "reports"]) => {
			require_platform_admin(&caller)?;
			let reports = store.list_reports().await?;
			Ok((StatusCode::OK, json!(reports)))
		}
		(Method::PATCH, ["api", "reports", mid, "action-taken"]) => {
			require_platform_admin(&caller)?;
			let patch: ActionTakenBody = parse_body(&body)?;
			let mid = message_id(mid)?;
			store.set_report_action_taken(&mid, patch.action_taken).await?;
			Ok((StatusCode::OK, json!(mid)))
		}
		(Method::DELETE, ["api", "reports", mid]) => {
			require_platform_admin(&caller)?;
			let mid = message_id(mid)?;
			store.withdraw_report(&mid).await?;
			Ok((StatusCode::OK, json!(mid)))
		}
		_ => Err(ActionError::NotFound(format!("no route: {path}")).into()),
	}
}

/// Flag carries a report body; unflag withdraws the report alongside.
async fn toggle_flag(
	store: &Store,
	community: &CommunityId,
	message_id: &MessageId,
	caller: &UserId,
	body: &[u8],
) -> Result<bool, RestError> {
	let current = store.fetch_message(community, message_id).await?;
	if current.flagged {
		let outcome = moderation::unflag_message(store, community, message_id, caller).await?;
		if outcome == UnflagOutcome::ReportMissing {
			warn!(%message_id, "unflagged a message that had no report on file");
		}
		Ok(false)
	} else {
		let context: FlagBody = parse_body(body)?;
		let report = ReportDraft {
			group_name: context.group_name,
			message: context.message,
			reported_by: caller.clone(),
			message_by: current.user_id,
		};
		moderation::flag_message(store, community, message_id, caller, &report).await?;
		Ok(true)
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagBody {
	group_name: String,
	message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionTakenBody {
	action_taken: bool,
}

fn authenticate(req: &Request<Incoming>, secret: Option<&SecretString>) -> Result<UserId, RestError> {
	let token = req
		.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.ok_or(RestError::Action(ActionError::NotAuthenticated))?;

	let claimed = query_param(req.uri().query(), "userId").ok_or(RestError::Action(ActionError::NotAuthenticated))?;
	if !verify_user_token(token, &claimed, secret) {
		return Err(ActionError::NotAuthenticated.into());
	}

	UserId::new(claimed).map_err(|_| ActionError::NotAuthenticated.into())
}

fn require_platform_admin(caller: &UserId) -> Result<(), RestError> {
	if caller.is_platform_admin() {
		Ok(())
	} else {
		Err(ActionError::NotAuthorized(format!("user {caller} may not manage communities")).into())
	}
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
	query?
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == key)
		.map(|(_, v)| v.to_string())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RestError> {
	serde_json::from_slice(body).map_err(|e| RestError::BadRequest(format!("invalid request body: {e}")))
}

fn community_id(raw: &str) -> Result<CommunityId, RestError> {
	CommunityId::new(raw).map_err(|e| RestError::BadRequest(format!("invalid community id: {e}")))
}

fn user_id(raw: &str) -> Result<UserId, RestError> {
	UserId::new(raw).map_err(|e| RestError::BadRequest(format!("invalid user id: {e}")))
}

fn message_id(raw: &str) -> Result<MessageId, RestError> {
	MessageId::parse(raw).map_err(|e| RestError::BadRequest(format!("invalid message id: {e}")))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
	let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
	let mut response = Response::new(Full::new(Bytes::from(bytes)));
	*response.status_mut() = status;
	response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	response
}
