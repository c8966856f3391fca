#![forbid(unsafe_code)]

//! Failure taxonomy for chat verbs and management routes.
//!
//! Both surfaces map the same way: a variant picks the wire error code (or
//! HTTP status) and a public message that is safe to hand to clients, while
//! `Internal` keeps its cause server-side.

use homeroom_protocol::pb;

use super::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
	#[error("not authenticated")]
	NotAuthenticated,

	#[error("not authorized: {0}")]
	NotAuthorized(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl ActionError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::NotAuthenticated => pb::code::NOT_AUTHENTICATED,
			Self::NotAuthorized(_) => pb::code::NOT_AUTHORIZED,
			Self::NotFound(_) => pb::code::NOT_FOUND,
			Self::Conflict(_) => pb::code::CONFLICT,
			Self::Internal(_) => pb::code::INTERNAL,
		}
	}

	/// Message suitable for an `ErrorNotice` or HTTP body.
	pub fn public_message(&self) -> String {
		match self {
			Self::NotAuthenticated => "not authenticated".to_string(),
			Self::NotAuthorized(msg) | Self::NotFound(msg) | Self::Conflict(msg) => msg.clone(),
			Self::Internal(_) => "internal error".to_string(),
		}
	}
}

impl From<StoreError> for ActionError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::CommunityNotFound(id) => Self::NotFound(format!("community not found: {id}")),
			StoreError::MessageNotFound(id) => Self::NotFound(format!("message not found: {id}")),
			StoreError::ReportNotFound(id) => Self::NotFound(format!("no report on file for message: {id}")),
			StoreError::MemberNotFound(id) => Self::NotFound(format!("member not found: {id}")),
			StoreError::CommunityExists(id) => Self::Conflict(format!("community already exists: {id}")),
			StoreError::CollectionExists(id) => Self::Conflict(format!("message collection already exists: {id}")),
			StoreError::AlreadyFlagged(id) => Self::Conflict(format!("message already flagged: {id}")),
			StoreError::NotFlagged(id) => Self::Conflict(format!("message not flagged: {id}")),
			err @ (StoreError::Corrupt(_) | StoreError::Database(_)) => Self::Internal(err.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use homeroom_domain::MessageId;

	use super::*;

	#[test]
	fn store_errors_map_to_codes() {
		let id = MessageId::new_v4();

		let err = ActionError::from(StoreError::MessageNotFound(id));
		assert_eq!(err.code(), pb::code::NOT_FOUND);
		assert!(err.public_message().contains(&id.to_string()));

		let err = ActionError::from(StoreError::AlreadyFlagged(id));
		assert_eq!(err.code(), pb::code::CONFLICT);

		let err = ActionError::from(StoreError::Corrupt("bad row".into()));
		assert_eq!(err.code(), pb::code::INTERNAL);
		assert_eq!(err.public_message(), "internal error");
	}
}
