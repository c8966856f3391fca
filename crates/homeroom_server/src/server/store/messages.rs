#![forbid(unsafe_code)]

use homeroom_domain::{CommunityId, MessageDraft, MessageId, StoredMessage};

use super::{MessageRow, Store, StoreBackend, StoreError, is_unique_violation};

const SELECT_MESSAGE_COLUMNS: &str = "SELECT id, community_id, user_id, user_name, user_profile_picture, text, \
	file_name, file_content_type, file_url, flagged, created_at_unix_ms FROM messages";

impl Store {
	/// Create the single message collection for a community.
	pub async fn create_collection(&self, community: &CommunityId, now_ms: i64) -> Result<(), StoreError> {
		let res = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_collections (community_id, created_at_unix_ms) \
					SELECT ?, ? WHERE EXISTS (SELECT id FROM communities WHERE id = ?)",
				)
				.bind(community.as_str())
				.bind(now_ms)
				.bind(community.as_str())
				.execute(pool)
				.await
				.map(|done| done.rows_affected())
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_collections (community_id, created_at_unix_ms) \
					SELECT $1, $2 WHERE EXISTS (SELECT id FROM communities WHERE id = $3)",
				)
				.bind(community.as_str())
				.bind(now_ms)
				.bind(community.as_str())
				.execute(pool)
				.await
				.map(|done| done.rows_affected())
			}
		};

		match res {
			Ok(0) => Err(StoreError::CommunityNotFound(community.clone())),
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => Err(StoreError::CollectionExists(community.clone())),
			Err(e) => Err(e.into()),
		}
	}

	/// Fetch a community's collection: `None` when no collection has been
	/// created, `Some(messages)` in append order otherwise.
	pub async fn fetch_collection(&self, community: &CommunityId) -> Result<Option<Vec<StoredMessage>>, StoreError> {
		let rows = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let exists: Option<(String,)> =
					sqlx::query_as("SELECT community_id FROM message_collections WHERE community_id = ?")
						.bind(community.as_str())
						.fetch_optional(pool)
						.await?;
				if exists.is_none() {
					return Ok(None);
				}

				sqlx::query_as::<_, MessageRow>(&format!(
					"{SELECT_MESSAGE_COLUMNS} WHERE community_id = ? ORDER BY seq ASC"
				))
				.bind(community.as_str())
				.fetch_all(pool)
				.await?
			}
			StoreBackend::Postgres(pool) => {
				let exists: Option<(String,)> =
					sqlx::query_as("SELECT community_id FROM message_collections WHERE community_id = $1")
						.bind(community.as_str())
						.fetch_optional(pool)
						.await?;
				if exists.is_none() {
					return Ok(None);
				}

				sqlx::query_as::<_, MessageRow>(&format!(
					"{SELECT_MESSAGE_COLUMNS} WHERE community_id = $1 ORDER BY seq ASC"
				))
				.bind(community.as_str())
				.fetch_all(pool)
				.await?
			}
		};

		let mut messages = Vec::with_capacity(rows.len());
		for row in rows {
			messages.push(row.into_stored()?);
		}
		Ok(Some(messages))
	}

	/// Fetch a single message by id within a community.
	pub async fn fetch_message(&self, community: &CommunityId, message_id: &MessageId) -> Result<StoredMessage, StoreError> {
		let row = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!("{SELECT_MESSAGE_COLUMNS} WHERE community_id = ? AND id = ?"))
					.bind(community.as_str())
					.bind(message_id.to_string())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!("{SELECT_MESSAGE_COLUMNS} WHERE community_id = $1 AND id = $2"))
					.bind(community.as_str())
					.bind(message_id.to_string())
					.fetch_optional(pool)
					.await?
			}
		};

		match row {
			Some(row) => row.into_stored(),
			None => Err(StoreError::MessageNotFound(*message_id)),
		}
	}

	/// Append a message to a community's collection.
	///
	/// The insert is gated on the collection row existing, so a send into a
	/// community without a collection fails atomically instead of creating
	/// one as a side effect.
	pub async fn append_message(
		&self,
		community: &CommunityId,
		id: MessageId,
		draft: &MessageDraft,
		now_ms: i64,
	) -> Result<StoredMessage, StoreError> {
		let (file_name, file_content_type, file_url) = match &draft.file {
			Some(f) => (Some(f.name.clone()), Some(f.content_type.clone()), Some(f.url.clone())),
			None => (None, None, None),
		};

		let done = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, community_id, user_id, user_name, user_profile_picture, text, \
					file_name, file_content_type, file_url, flagged, created_at_unix_ms) \
					SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE, ? \
					WHERE EXISTS (SELECT community_id FROM message_collections WHERE community_id = ?)",
				)
				.bind(id.to_string())
				.bind(community.as_str())
				.bind(draft.user_id.as_str())
				.bind(&draft.user_name)
				.bind(&draft.user_profile_picture)
				.bind(&draft.text)
				.bind(&file_name)
				.bind(&file_content_type)
				.bind(&file_url)
				.bind(now_ms)
				.bind(community.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, community_id, user_id, user_name, user_profile_picture, text, \
					file_name, file_content_type, file_url, flagged, created_at_unix_ms) \
					SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10 \
					WHERE EXISTS (SELECT community_id FROM message_collections WHERE community_id = $11)",
				)
				.bind(id.to_string())
				.bind(community.as_str())
				.bind(draft.user_id.as_str())
				.bind(&draft.user_name)
				.bind(&draft.user_profile_picture)
				.bind(&draft.text)
				.bind(&file_name)
				.bind(&file_content_type)
				.bind(&file_url)
				.bind(now_ms)
				.bind(community.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
		};

		if done == 0 {
			return Err(StoreError::CommunityNotFound(community.clone()));
		}

		Ok(StoredMessage {
			id,
			community_id: community.clone(),
			user_id: draft.user_id.clone(),
			user_name: draft.user_name.clone(),
			user_profile_picture: draft.user_profile_picture.clone(),
			text: draft.text.clone(),
			file: draft.file.clone(),
			flagged: false,
			created_at_unix_ms: now_ms,
		})
	}

	/// Delete a message and any report filed against it.
	pub async fn delete_message(&self, community: &CommunityId, message_id: &MessageId) -> Result<(), StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM messages WHERE community_id = ? AND id = ?")
					.bind(community.as_str())
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::MessageNotFound(*message_id));
				}

				sqlx::query("DELETE FROM reported_messages WHERE message_id = ?")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM messages WHERE community_id = $1 AND id = $2")
					.bind(community.as_str())
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::MessageNotFound(*message_id));
				}

				sqlx::query("DELETE FROM reported_messages WHERE message_id = $1")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
		}

		Ok(())
	}

	/// Delete a community's collection together with its messages and reports.
	pub async fn delete_collection(&self, community: &CommunityId) -> Result<(), StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM message_collections WHERE community_id = ?")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::CommunityNotFound(community.clone()));
				}

				sqlx::query("DELETE FROM messages WHERE community_id = ?")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM reported_messages WHERE group_id = ?")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM message_collections WHERE community_id = $1")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::CommunityNotFound(community.clone()));
				}

				sqlx::query("DELETE FROM messages WHERE community_id = $1")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM reported_messages WHERE group_id = $1")
					.bind(community.as_str())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
		}

		Ok(())
	}
}
