#![forbid(unsafe_code)]

//! Moderation policy shared by the chat verbs and the management routes.
//!
//! Deleting a message is reserved for platform admins. Flagging and
//! unflagging extend to community admins, which needs a roster lookup.

use homeroom_domain::{CommunityId, MessageId, ReportDraft, UserId};

use super::action::ActionError;
use super::store::{Store, UnflagOutcome};
use crate::util::time::unix_ms_now;

/// Platform admins may delete any message; nobody else may.
pub fn authorize_delete(user: &UserId) -> Result<(), ActionError> {
	if user.is_platform_admin() {
		Ok(())
	} else {
		Err(ActionError::NotAuthorized(format!("user {user} may not delete messages")))
	}
}

/// Platform admins moderate everywhere; community admins moderate their own
/// community.
pub async fn authorize_moderator(store: &Store, community: &CommunityId, user: &UserId) -> Result<(), ActionError> {
	if user.is_platform_admin() {
		return Ok(());
	}

	match store.member_is_admin(community, user).await? {
		Some(true) => Ok(()),
		Some(false) | None => Err(ActionError::NotAuthorized(format!(
			"user {user} is not a moderator of community {community}"
		))),
	}
}

pub async fn delete_message(
	store: &Store,
	community: &CommunityId,
	message_id: &MessageId,
	user: &UserId,
) -> Result<(), ActionError> {
	authorize_delete(user)?;
	store.delete_message(community, message_id).await?;
	Ok(())
}

pub async fn flag_message(
	store: &Store,
	community: &CommunityId,
	message_id: &MessageId,
	user: &UserId,
	report: &ReportDraft,
) -> Result<(), ActionError> {
	authorize_moderator(store, community, user).await?;
	store.flag_message(community, message_id, report, unix_ms_now()).await?;
	Ok(())
}

pub async fn unflag_message(
	store: &Store,
	community: &CommunityId,
	message_id: &MessageId,
	user: &UserId,
) -> Result<UnflagOutcome, ActionError> {
	authorize_moderator(store, community, user).await?;
	Ok(store.unflag_message(community, message_id).await?)
}

#[cfg(test)]
mod tests {
	use homeroom_domain::{Community, MessageDraft, RosterEntry};
	use homeroom_protocol::pb;

	use super::*;

	async fn store_with_community() -> (Store, CommunityId) {
		let store = Store::connect("sqlite::memory:").await.expect("connect");
		let id = CommunityId::new("c-mod").expect("id");
		store
			.create_community(
				&Community {
					id: id.clone(),
					name: "Cedar Park".to_string(),
					state: "TX".to_string(),
					city: "Cedar Park".to_string(),
					builder: "Acme Homes".to_string(),
					thumbnail: None,
					projects: Vec::new(),
					members: vec![
						RosterEntry {
							user_id: UserId::new("u-lead").expect("id"),
							name: "Lead".to_string(),
							phone: None,
							profile_picture: None,
							is_admin: true,
						},
						RosterEntry {
							user_id: UserId::new("u-plain").expect("id"),
							name: "Plain".to_string(),
							phone: None,
							profile_picture: None,
							is_admin: false,
						},
					],
				},
				1_000,
			)
			.await
			.expect("create community");
		store.create_collection(&id, 1_000).await.expect("create collection");
		(store, id)
	}

	#[test]
	fn only_platform_admins_delete() {
		assert!(authorize_delete(&UserId::new("IPA-1").unwrap()).is_ok());

		let err = authorize_delete(&UserId::new("u-lead").unwrap()).unwrap_err();
		assert_eq!(err.code(), pb::code::NOT_AUTHORIZED);
	}

	#[tokio::test]
	async fn community_admins_moderate_their_community() {
		let (store, id) = store_with_community().await;

		assert!(authorize_moderator(&store, &id, &UserId::new("IPA-1").unwrap()).await.is_ok());
		assert!(authorize_moderator(&store, &id, &UserId::new("u-lead").unwrap()).await.is_ok());

		let err = authorize_moderator(&store, &id, &UserId::new("u-plain").unwrap())
			.await
			.unwrap_err();
		assert_eq!(err.code(), pb::code::NOT_AUTHORIZED);

		let err = authorize_moderator(&store, &id, &UserId::new("u-stranger").unwrap())
			.await
			.unwrap_err();
		assert_eq!(err.code(), pb::code::NOT_AUTHORIZED);
	}

	#[tokio::test]
	async fn flag_then_unflag_round_trip() {
		let (store, id) = store_with_community().await;
		let msg_id = MessageId::new_v4();
		store
			.append_message(
				&id,
				msg_id,
				&MessageDraft {
					user_id: UserId::new("u-plain").unwrap(),
					user_name: "Plain".to_string(),
					user_profile_picture: None,
					text: Some("spam".to_string()),
					file: None,
				},
				2_000,
			)
			.await
			.expect("append");

		let lead = UserId::new("u-lead").unwrap();
		let report = ReportDraft {
			group_name: "Cedar Park".to_string(),
			message: "spam".to_string(),
			reported_by: lead.clone(),
			message_by: UserId::new("u-plain").unwrap(),
		};

		flag_message(&store, &id, &msg_id, &lead, &report).await.expect("flag");
		let outcome = unflag_message(&store, &id, &msg_id, &lead).await.expect("unflag");
		assert_eq!(outcome, UnflagOutcome::ReportWithdrawn);

		// Plain members bounce off the policy before the store is touched.
		let err = flag_message(&store, &id, &msg_id, &UserId::new("u-plain").unwrap(), &report)
			.await
			.unwrap_err();
		assert_eq!(err.code(), pb::code::NOT_AUTHORIZED);
	}
}
