#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, try_decode_frame_from_buffer,
};

/// Wire types (`homeroom.v1`).
#[allow(clippy::large_enum_variant)]
pub mod pb;

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}

/// Conversions between wire types and domain types.
pub mod convert {
	use homeroom_domain::{
		CommunityId, FileAttachment, MessageDraft, MessageId, ParseIdError, ReportDraft, StoredMessage, UserId,
	};

	use crate::pb;

	impl From<FileAttachment> for pb::FileAttachment {
		fn from(f: FileAttachment) -> Self {
			Self {
				name: f.name,
				content_type: f.content_type,
				url: f.url,
			}
		}
	}

	impl From<pb::FileAttachment> for FileAttachment {
		fn from(f: pb::FileAttachment) -> Self {
			Self {
				name: f.name,
				content_type: f.content_type,
				url: f.url,
			}
		}
	}

	impl From<StoredMessage> for pb::ChatMessage {
		fn from(m: StoredMessage) -> Self {
			Self {
				id: m.id.to_string(),
				user_id: m.user_id.into_string(),
				user_name: m.user_name,
				user_profile_picture: m.user_profile_picture,
				text: m.text,
				file: m.file.map(Into::into),
				flagged: m.flagged,
				created_at_unix_ms: m.created_at_unix_ms,
			}
		}
	}

	impl TryFrom<pb::MessageDraft> for MessageDraft {
		type Error = ParseIdError;

		fn try_from(d: pb::MessageDraft) -> Result<Self, Self::Error> {
			let draft = Self {
				user_id: UserId::new(d.user_id)?,
				user_name: d.user_name,
				user_profile_picture: d.user_profile_picture.filter(|s| !s.trim().is_empty()),
				text: d.text.filter(|s| !s.trim().is_empty()),
				file: d.file.map(Into::into),
			};
			draft.validate()?;
			Ok(draft)
		}
	}

	impl TryFrom<pb::ReportDraft> for ReportDraft {
		type Error = ParseIdError;

		fn try_from(r: pb::ReportDraft) -> Result<Self, Self::Error> {
			Ok(Self {
				group_name: r.group_name,
				message: r.message,
				reported_by: UserId::new(r.reported_by)?,
				message_by: UserId::new(r.message_by)?,
			})
		}
	}

	/// Build the replay payload for a joining connection.
	pub fn collection_envelope(community_id: &CommunityId, messages: Option<Vec<StoredMessage>>) -> pb::ExistingMessages {
		pb::ExistingMessages {
			community_id: community_id.to_string(),
			collection: messages.map(|msgs| pb::MessageCollection {
				community_id: community_id.to_string(),
				messages: msgs.into_iter().map(Into::into).collect(),
			}),
		}
	}

	/// Parse a wire message id.
	pub fn parse_message_id(s: &str) -> Result<MessageId, ParseIdError> {
		MessageId::parse(s)
	}

	#[cfg(test)]
	mod tests {
		use homeroom_domain::{CommunityId, MessageId, StoredMessage, UserId};

		use super::*;

		fn stored(text: &str) -> StoredMessage {
			StoredMessage {
				id: MessageId::new_v4(),
				community_id: CommunityId::new("c-1").unwrap(),
				user_id: UserId::new("u-1").unwrap(),
				user_name: "Dana".to_string(),
				user_profile_picture: None,
				text: Some(text.to_string()),
				file: None,
				flagged: false,
				created_at_unix_ms: 1_700_000_000_000,
			}
		}

		#[test]
		fn collection_envelope_preserves_order() {
			let community = CommunityId::new("c-1").unwrap();
			let msgs = vec![stored("first"), stored("second"), stored("third")];
			let ids: Vec<String> = msgs.iter().map(|m| m.id.to_string()).collect();

			let env = collection_envelope(&community, Some(msgs));
			let collection = env.collection.expect("collection present");
			let got: Vec<String> = collection.messages.iter().map(|m| m.id.clone()).collect();
			assert_eq!(got, ids);
		}

		#[test]
		fn collection_envelope_absent_when_no_collection() {
			let community = CommunityId::new("c-1").unwrap();
			let env = collection_envelope(&community, None);
			assert!(env.collection.is_none());
			assert_eq!(env.community_id, "c-1");
		}

		#[test]
		fn draft_conversion_rejects_empty_content() {
			let d = pb::MessageDraft {
				user_id: "u-1".to_string(),
				user_name: "Dana".to_string(),
				user_profile_picture: None,
				text: Some("   ".to_string()),
				file: None,
			};
			assert!(MessageDraft::try_from(d).is_err());
		}

		#[test]
		fn draft_conversion_rejects_empty_user() {
			let d = pb::MessageDraft {
				user_id: String::new(),
				user_name: "Dana".to_string(),
				user_profile_picture: None,
				text: Some("hi".to_string()),
				file: None,
			};
			assert!(MessageDraft::try_from(d).is_err());
		}
	}
}
