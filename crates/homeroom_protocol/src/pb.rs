#![forbid(unsafe_code)]

//! Wire types for `homeroom.v1`.
//!
//! Hand-maintained prost derives; tags are frozen once released.

/// Top-level frame payload, both directions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,

	/// Correlates a reply with a client request; empty for unsolicited frames.
	#[prost(string, tag = "2")]
	pub request_id: String,

	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21")]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Ping(super::Ping),
		#[prost(message, tag = "13")]
		Pong(super::Pong),
		#[prost(message, tag = "14")]
		JoinCommunity(super::JoinCommunity),
		#[prost(message, tag = "15")]
		ExistingMessages(super::ExistingMessages),
		#[prost(message, tag = "16")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "17")]
		DeleteMessage(super::DeleteMessage),
		#[prost(message, tag = "18")]
		FlagMessage(super::FlagMessage),
		#[prost(message, tag = "19")]
		UnflagMessage(super::UnflagMessage),
		#[prost(message, tag = "20")]
		Error(super::ErrorNotice),
		#[prost(message, tag = "21")]
		Event(super::EventEnvelope),
	}
}

/// First client frame on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: String,

	#[prost(string, tag = "2")]
	pub client_instance_id: String,

	/// Origin the client claims to connect from; checked against the
	/// server's allow-list when one is configured.
	#[prost(string, tag = "3")]
	pub origin: String,
}

/// Server reply to `Hello`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,

	#[prost(string, tag = "2")]
	pub server_instance_id: String,

	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,

	#[prost(uint32, tag = "4")]
	pub max_frame_bytes: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,

	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// Enter a community room; replied to with `ExistingMessages` on success.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinCommunity {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub user_id: String,

	#[prost(string, tag = "3")]
	pub user_token: String,
}

/// Full replay sent to the joining connection only.
///
/// `collection` is absent when the community has no message collection yet;
/// that is a valid empty state, not an error.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExistingMessages {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(message, optional, tag = "2")]
	pub collection: Option<MessageCollection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageCollection {
	#[prost(string, tag = "1")]
	pub community_id: String,

	/// Messages in server append order.
	#[prost(message, repeated, tag = "2")]
	pub messages: Vec<ChatMessage>,
}

/// A committed message with server-assigned id and timestamp.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: String,

	#[prost(string, tag = "2")]
	pub user_id: String,

	#[prost(string, tag = "3")]
	pub user_name: String,

	#[prost(string, optional, tag = "4")]
	pub user_profile_picture: Option<String>,

	#[prost(string, optional, tag = "5")]
	pub text: Option<String>,

	#[prost(message, optional, tag = "6")]
	pub file: Option<FileAttachment>,

	#[prost(bool, tag = "7")]
	pub flagged: bool,

	#[prost(int64, tag = "8")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileAttachment {
	#[prost(string, tag = "1")]
	pub name: String,

	#[prost(string, tag = "2")]
	pub content_type: String,

	#[prost(string, tag = "3")]
	pub url: String,
}

/// Client-supplied message content; the server assigns id and timestamp.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageDraft {
	#[prost(string, tag = "1")]
	pub user_id: String,

	#[prost(string, tag = "2")]
	pub user_name: String,

	#[prost(string, optional, tag = "3")]
	pub user_profile_picture: Option<String>,

	#[prost(string, optional, tag = "4")]
	pub text: Option<String>,

	#[prost(message, optional, tag = "5")]
	pub file: Option<FileAttachment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub user_token: String,

	#[prost(message, optional, tag = "3")]
	pub message: Option<MessageDraft>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMessage {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,

	#[prost(string, tag = "3")]
	pub user_id: String,

	#[prost(string, tag = "4")]
	pub user_token: String,
}

/// Caller context recorded alongside a flag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportDraft {
	#[prost(string, tag = "1")]
	pub group_name: String,

	#[prost(string, tag = "2")]
	pub message: String,

	#[prost(string, tag = "3")]
	pub reported_by: String,

	#[prost(string, tag = "4")]
	pub message_by: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlagMessage {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,

	#[prost(string, tag = "3")]
	pub user_id: String,

	#[prost(string, tag = "4")]
	pub user_token: String,

	#[prost(message, optional, tag = "5")]
	pub report: Option<ReportDraft>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnflagMessage {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,

	#[prost(string, tag = "3")]
	pub user_id: String,

	#[prost(string, tag = "4")]
	pub user_token: String,
}

/// Sender-only failure notice; never broadcast.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorNotice {
	#[prost(string, tag = "1")]
	pub code: String,

	#[prost(string, tag = "2")]
	pub message: String,

	/// Community the failed action addressed; empty for pre-join failures.
	#[prost(string, tag = "3")]
	pub community_id: String,
}

/// Broadcast wrapper for committed room events.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,

	#[prost(oneof = "event_envelope::Event", tags = "10, 11, 12, 13")]
	pub event: Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		NewMessage(super::NewMessageEvent),
		#[prost(message, tag = "11")]
		MessageDeleted(super::MessageDeletedEvent),
		#[prost(message, tag = "12")]
		MessageFlagged(super::MessageFlaggedEvent),
		#[prost(message, tag = "13")]
		MessageUnflagged(super::MessageUnflaggedEvent),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewMessageEvent {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(message, optional, tag = "2")]
	pub message: Option<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageDeletedEvent {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageFlaggedEvent {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,

	#[prost(bool, tag = "3")]
	pub flagged: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageUnflaggedEvent {
	#[prost(string, tag = "1")]
	pub community_id: String,

	#[prost(string, tag = "2")]
	pub message_id: String,

	#[prost(bool, tag = "3")]
	pub flagged: bool,
}

/// Stable error codes carried in `ErrorNotice.code`.
pub mod code {
	pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
	pub const NOT_AUTHORIZED: &str = "NOT_AUTHORIZED";
	pub const NOT_FOUND: &str = "NOT_FOUND";
	pub const CONFLICT: &str = "CONFLICT";
	pub const INTERNAL: &str = "INTERNAL";
}
