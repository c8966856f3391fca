#![forbid(unsafe_code)]

use homeroom_domain::{CommunityId, MessageId, ReportDraft, ReportedMessage};

use super::{ReportRow, Store, StoreBackend, StoreError, is_unique_violation};

const SELECT_REPORT_COLUMNS: &str = "SELECT group_name, group_id, message, message_id, reported_by, message_by, \
	action_taken, created_at_unix_ms FROM reported_messages";

/// Result of a committed unflag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnflagOutcome {
	/// The flag was reverted and the companion report withdrawn.
	ReportWithdrawn,

	/// The flag was reverted but no report was on file.
	ReportMissing,
}

impl Store {
	/// Flag a message and file its report in one transaction.
	///
	/// The flag flip is a compare-and-set on `flagged = FALSE`; a second
	/// flagger loses and the stored report is left untouched.
	pub async fn flag_message(
		&self,
		community: &CommunityId,
		message_id: &MessageId,
		report: &ReportDraft,
		now_ms: i64,
	) -> Result<(), StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("UPDATE messages SET flagged = TRUE WHERE community_id = ? AND id = ? AND flagged = FALSE")
					.bind(community.as_str())
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE community_id = ? AND id = ?")
						.bind(community.as_str())
						.bind(message_id.to_string())
						.fetch_optional(&mut *tx)
						.await?;
					return Err(match exists {
						Some(_) => StoreError::AlreadyFlagged(*message_id),
						None => StoreError::MessageNotFound(*message_id),
					});
				}

				let res = sqlx::query(
					"INSERT INTO reported_messages (group_name, group_id, message, message_id, reported_by, message_by, \
					action_taken, created_at_unix_ms) VALUES (?, ?, ?, ?, ?, ?, FALSE, ?)",
				)
				.bind(&report.group_name)
				.bind(community.as_str())
				.bind(&report.message)
				.bind(message_id.to_string())
				.bind(report.reported_by.as_str())
				.bind(report.message_by.as_str())
				.bind(now_ms)
				.execute(&mut *tx)
				.await;

				match res {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::AlreadyFlagged(*message_id)),
					Err(e) => return Err(e.into()),
				}

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done =
					sqlx::query("UPDATE messages SET flagged = TRUE WHERE community_id = $1 AND id = $2 AND flagged = FALSE")
						.bind(community.as_str())
						.bind(message_id.to_string())
						.execute(&mut *tx)
						.await?;
				if done.rows_affected() == 0 {
					let exists: Option<(String,)> =
						sqlx::query_as("SELECT id FROM messages WHERE community_id = $1 AND id = $2")
							.bind(community.as_str())
							.bind(message_id.to_string())
							.fetch_optional(&mut *tx)
							.await?;
					return Err(match exists {
						Some(_) => StoreError::AlreadyFlagged(*message_id),
						None => StoreError::MessageNotFound(*message_id),
					});
				}

				let res = sqlx::query(
					"INSERT INTO reported_messages (group_name, group_id, message, message_id, reported_by, message_by, \
					action_taken, created_at_unix_ms) VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)",
				)
				.bind(&report.group_name)
				.bind(community.as_str())
				.bind(&report.message)
				.bind(message_id.to_string())
				.bind(report.reported_by.as_str())
				.bind(report.message_by.as_str())
				.bind(now_ms)
				.execute(&mut *tx)
				.await;

				match res {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::AlreadyFlagged(*message_id)),
					Err(e) => return Err(e.into()),
				}

				tx.commit().await?;
			}
		}

		Ok(())
	}

	/// Revert a flag and withdraw its report in one transaction.
	///
	/// A missing report is not an error: the flag reversal still commits and
	/// the caller decides how loudly to complain.
	pub async fn unflag_message(&self, community: &CommunityId, message_id: &MessageId) -> Result<UnflagOutcome, StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("UPDATE messages SET flagged = FALSE WHERE community_id = ? AND id = ? AND flagged = TRUE")
					.bind(community.as_str())
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE community_id = ? AND id = ?")
						.bind(community.as_str())
						.bind(message_id.to_string())
						.fetch_optional(&mut *tx)
						.await?;
					return Err(match exists {
						Some(_) => StoreError::NotFlagged(*message_id),
						None => StoreError::MessageNotFound(*message_id),
					});
				}

				let deleted = sqlx::query("DELETE FROM reported_messages WHERE message_id = ?")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;

				Ok(if deleted.rows_affected() > 0 {
					UnflagOutcome::ReportWithdrawn
				} else {
					UnflagOutcome::ReportMissing
				})
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done =
					sqlx::query("UPDATE messages SET flagged = FALSE WHERE community_id = $1 AND id = $2 AND flagged = TRUE")
						.bind(community.as_str())
						.bind(message_id.to_string())
						.execute(&mut *tx)
						.await?;
				if done.rows_affected() == 0 {
					let exists: Option<(String,)> =
						sqlx::query_as("SELECT id FROM messages WHERE community_id = $1 AND id = $2")
							.bind(community.as_str())
							.bind(message_id.to_string())
							.fetch_optional(&mut *tx)
							.await?;
					return Err(match exists {
						Some(_) => StoreError::NotFlagged(*message_id),
						None => StoreError::MessageNotFound(*message_id),
					});
				}

				let deleted = sqlx::query("DELETE FROM reported_messages WHERE message_id = $1")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;

				Ok(if deleted.rows_affected() > 0 {
					UnflagOutcome::ReportWithdrawn
				} else {
					UnflagOutcome::ReportMissing
				})
			}
		}
	}

	/// List all open reports, newest first.
	pub async fn list_reports(&self) -> Result<Vec<ReportedMessage>, StoreError> {
		let rows = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as::<_, ReportRow>(&format!("{SELECT_REPORT_COLUMNS} ORDER BY created_at_unix_ms DESC, id DESC"))
					.fetch_all(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as::<_, ReportRow>(&format!("{SELECT_REPORT_COLUMNS} ORDER BY created_at_unix_ms DESC, id DESC"))
					.fetch_all(pool)
					.await?
			}
		};

		let mut reports = Vec::with_capacity(rows.len());
		for row in rows {
			reports.push(row.into_report()?);
		}
		Ok(reports)
	}

	/// Fetch the report filed against a message.
	pub async fn fetch_report(&self, message_id: &MessageId) -> Result<ReportedMessage, StoreError> {
		let row = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as::<_, ReportRow>(&format!("{SELECT_REPORT_COLUMNS} WHERE message_id = ?"))
					.bind(message_id.to_string())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as::<_, ReportRow>(&format!("{SELECT_REPORT_COLUMNS} WHERE message_id = $1"))
					.bind(message_id.to_string())
					.fetch_optional(pool)
					.await?
			}
		};

		match row {
			Some(row) => row.into_report(),
			None => Err(StoreError::ReportNotFound(*message_id)),
		}
	}

	/// Record whether a moderator has acted on a report.
	pub async fn set_report_action_taken(&self, message_id: &MessageId, action_taken: bool) -> Result<(), StoreError> {
		let done = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE reported_messages SET action_taken = ? WHERE message_id = ?")
					.bind(action_taken)
					.bind(message_id.to_string())
					.execute(pool)
					.await?
					.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE reported_messages SET action_taken = $1 WHERE message_id = $2")
					.bind(action_taken)
					.bind(message_id.to_string())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if done == 0 {
			return Err(StoreError::ReportNotFound(*message_id));
		}

		Ok(())
	}

	/// Withdraw a report and clear the flag on its message.
	pub async fn withdraw_report(&self, message_id: &MessageId) -> Result<(), StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM reported_messages WHERE message_id = ?")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::ReportNotFound(*message_id));
				}

				sqlx::query("UPDATE messages SET flagged = FALSE WHERE id = ?")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM reported_messages WHERE message_id = $1")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::ReportNotFound(*message_id));
				}

				sqlx::query("UPDATE messages SET flagged = FALSE WHERE id = $1")
					.bind(message_id.to_string())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
		}

		Ok(())
	}
}
