#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Marker substring that designates platform-operator user ids.
///
/// Ids are issued by the identity provider and arrive in this shape; the
/// server derives [`Role`] from it instead of re-checking the raw id
/// everywhere.
pub const PLATFORM_ADMIN_ID_MARKER: &str = "IPA";

/// Access role derived from a user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	PlatformAdmin,
	Member,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::PlatformAdmin => "platform_admin",
			Role::Member => "member",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Externally-issued user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Role encoded in the id by the identity provider.
	pub fn role(&self) -> Role {
		if self.0.contains(PLATFORM_ADMIN_ID_MARKER) {
			Role::PlatformAdmin
		} else {
			Role::Member
		}
	}

	pub fn is_platform_admin(&self) -> bool {
		self.role() == Role::PlatformAdmin
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Community (chat room) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(String);

impl CommunityId {
	/// Create a non-empty `CommunityId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for CommunityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for CommunityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		CommunityId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	/// Parse a message id from its canonical string form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s}")))
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::parse(s)
	}
}

/// Optional file payload attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
	pub name: String,
	pub content_type: String,
	pub url: String,
}

/// Client-supplied message content, before the server assigns id and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
	pub user_id: UserId,
	pub user_name: String,
	pub user_profile_picture: Option<String>,
	pub text: Option<String>,
	pub file: Option<FileAttachment>,
}

impl MessageDraft {
	/// A draft must carry text, a file, or both.
	pub fn validate(&self) -> Result<(), ParseIdError> {
		let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
		if !has_text && self.file.is_none() {
			return Err(ParseIdError::InvalidFormat("message needs text or a file".into()));
		}
		Ok(())
	}
}

/// A committed message as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: MessageId,
	pub community_id: CommunityId,
	pub user_id: UserId,
	pub user_name: String,
	pub user_profile_picture: Option<String>,
	pub text: Option<String>,
	pub file: Option<FileAttachment>,
	pub flagged: bool,
	pub created_at_unix_ms: i64,
}

/// One community member on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
	pub user_id: UserId,
	pub name: String,
	pub phone: Option<String>,
	pub profile_picture: Option<String>,
	pub is_admin: bool,
}

/// A community with its member roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
	pub id: CommunityId,
	pub name: String,
	pub state: String,
	pub city: String,
	pub builder: String,
	pub thumbnail: Option<String>,
	pub projects: Vec<String>,
	pub members: Vec<RosterEntry>,
}

/// Caller-supplied context for a moderation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDraft {
	pub group_name: String,
	pub message: String,
	pub reported_by: UserId,
	pub message_by: UserId,
}

/// Companion record created when a message is flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedMessage {
	pub group_name: String,
	pub community_id: CommunityId,
	pub message: String,
	pub message_id: MessageId,
	pub reported_by: UserId,
	pub message_by: UserId,
	pub action_taken: bool,
	pub created_at_unix_ms: i64,
}

/// String holder that never reveals its contents via `Debug`/`Display`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
