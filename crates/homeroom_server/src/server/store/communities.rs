#![forbid(unsafe_code)]

use homeroom_domain::{Community, CommunityId, RosterEntry, UserId};

use super::{CommunityRow, MemberRow, Store, StoreBackend, StoreError, is_unique_violation};

impl Store {
	/// Create a community along with its initial roster.
	pub async fn create_community(&self, community: &Community, now_ms: i64) -> Result<(), StoreError> {
		let projects_json =
			serde_json::to_string(&community.projects).map_err(|e| StoreError::Corrupt(format!("encode projects: {e}")))?;

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let res = sqlx::query(
					"INSERT INTO communities (id, name, state, city, builder, thumbnail, projects_json, created_at_unix_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(community.id.as_str())
				.bind(&community.name)
				.bind(&community.state)
				.bind(&community.city)
				.bind(&community.builder)
				.bind(&community.thumbnail)
				.bind(&projects_json)
				.bind(now_ms)
				.execute(&mut *tx)
				.await;

				match res {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::CommunityExists(community.id.clone())),
					Err(e) => return Err(e.into()),
				}

				for member in &community.members {
					sqlx::query(
						"INSERT INTO community_members (community_id, user_id, name, phone, profile_picture, is_admin) \
						VALUES (?, ?, ?, ?, ?, ?)",
					)
					.bind(community.id.as_str())
					.bind(member.user_id.as_str())
					.bind(&member.name)
					.bind(&member.phone)
					.bind(&member.profile_picture)
					.bind(member.is_admin)
					.execute(&mut *tx)
					.await?;
				}

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let res = sqlx::query(
					"INSERT INTO communities (id, name, state, city, builder, thumbnail, projects_json, created_at_unix_ms) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(community.id.as_str())
				.bind(&community.name)
				.bind(&community.state)
				.bind(&community.city)
				.bind(&community.builder)
				.bind(&community.thumbnail)
				.bind(&projects_json)
				.bind(now_ms)
				.execute(&mut *tx)
				.await;

				match res {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::CommunityExists(community.id.clone())),
					Err(e) => return Err(e.into()),
				}

				for member in &community.members {
					sqlx::query(
						"INSERT INTO community_members (community_id, user_id, name, phone, profile_picture, is_admin) \
						VALUES ($1, $2, $3, $4, $5, $6)",
					)
					.bind(community.id.as_str())
					.bind(member.user_id.as_str())
					.bind(&member.name)
					.bind(&member.phone)
					.bind(&member.profile_picture)
					.bind(member.is_admin)
					.execute(&mut *tx)
					.await?;
				}

				tx.commit().await?;
			}
		}

		Ok(())
	}

	/// Fetch a community with its roster.
	pub async fn fetch_community(&self, id: &CommunityId) -> Result<Community, StoreError> {
		let (row, member_rows) = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let row = sqlx::query_as::<_, CommunityRow>(
					"SELECT id, name, state, city, builder, thumbnail, projects_json FROM communities WHERE id = ?",
				)
				.bind(id.as_str())
				.fetch_optional(pool)
				.await?;

				let members = sqlx::query_as::<_, MemberRow>(
					"SELECT user_id, name, phone, profile_picture, is_admin FROM community_members \
					WHERE community_id = ? ORDER BY user_id",
				)
				.bind(id.as_str())
				.fetch_all(pool)
				.await?;

				(row, members)
			}
			StoreBackend::Postgres(pool) => {
				let row = sqlx::query_as::<_, CommunityRow>(
					"SELECT id, name, state, city, builder, thumbnail, projects_json FROM communities WHERE id = $1",
				)
				.bind(id.as_str())
				.fetch_optional(pool)
				.await?;

				let members = sqlx::query_as::<_, MemberRow>(
					"SELECT user_id, name, phone, profile_picture, is_admin FROM community_members \
					WHERE community_id = $1 ORDER BY user_id",
				)
				.bind(id.as_str())
				.fetch_all(pool)
				.await?;

				(row, members)
			}
		};

		let Some(row) = row else {
			return Err(StoreError::CommunityNotFound(id.clone()));
		};

		let mut members = Vec::with_capacity(member_rows.len());
		for m in member_rows {
			members.push(m.into_entry()?);
		}

		row.into_community(members)
	}

	/// List all communities (roster omitted).
	pub async fn list_communities(&self) -> Result<Vec<Community>, StoreError> {
		let rows = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as::<_, CommunityRow>(
					"SELECT id, name, state, city, builder, thumbnail, projects_json FROM communities ORDER BY id",
				)
				.fetch_all(pool)
				.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as::<_, CommunityRow>(
					"SELECT id, name, state, city, builder, thumbnail, projects_json FROM communities ORDER BY id",
				)
				.fetch_all(pool)
				.await?
			}
		};

		let mut communities = Vec::with_capacity(rows.len());
		for row in rows {
			communities.push(row.into_community(Vec::new())?);
		}
		Ok(communities)
	}

	/// Delete a community and its roster. Messages and reports live with the
	/// collection and are removed via `delete_collection`.
	pub async fn delete_community(&self, id: &CommunityId) -> Result<(), StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM communities WHERE id = ?")
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::CommunityNotFound(id.clone()));
				}

				sqlx::query("DELETE FROM community_members WHERE community_id = ?")
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query("DELETE FROM communities WHERE id = $1")
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::CommunityNotFound(id.clone()));
				}

				sqlx::query("DELETE FROM community_members WHERE community_id = $1")
					.bind(id.as_str())
					.execute(&mut *tx)
					.await?;

				tx.commit().await?;
			}
		}

		Ok(())
	}

	/// Add a member to a community's roster; re-adding is a no-op.
	pub async fn add_member(&self, community: &CommunityId, entry: &RosterEntry) -> Result<(), StoreError> {
		let done = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO community_members (community_id, user_id, name, phone, profile_picture, is_admin) \
					SELECT ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT id FROM communities WHERE id = ?) \
					ON CONFLICT (community_id, user_id) DO NOTHING",
				)
				.bind(community.as_str())
				.bind(entry.user_id.as_str())
				.bind(&entry.name)
				.bind(&entry.phone)
				.bind(&entry.profile_picture)
				.bind(entry.is_admin)
				.bind(community.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO community_members (community_id, user_id, name, phone, profile_picture, is_admin) \
					SELECT $1, $2, $3, $4, $5, $6 WHERE EXISTS (SELECT id FROM communities WHERE id = $7) \
					ON CONFLICT (community_id, user_id) DO NOTHING",
				)
				.bind(community.as_str())
				.bind(entry.user_id.as_str())
				.bind(&entry.name)
				.bind(&entry.phone)
				.bind(&entry.profile_picture)
				.bind(entry.is_admin)
				.bind(community.as_str())
				.execute(pool)
				.await?
				.rows_affected()
			}
		};

		// Zero rows is either the conflict no-op or a missing community;
		// disambiguate only in the failure case.
		if done == 0 && !self.community_exists(community).await? {
			return Err(StoreError::CommunityNotFound(community.clone()));
		}

		Ok(())
	}

	/// Remove a member from a community's roster.
	pub async fn remove_member(&self, community: &CommunityId, user_id: &UserId) -> Result<(), StoreError> {
		let done = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM community_members WHERE community_id = ? AND user_id = ?")
					.bind(community.as_str())
					.bind(user_id.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM community_members WHERE community_id = $1 AND user_id = $2")
					.bind(community.as_str())
					.bind(user_id.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if done == 0 {
			return Err(StoreError::MemberNotFound(user_id.clone()));
		}

		Ok(())
	}

	/// Flip a member's community-admin bit; returns the new value.
	pub async fn toggle_member_admin(&self, community: &CommunityId, user_id: &UserId) -> Result<bool, StoreError> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let done = sqlx::query(
					"UPDATE community_members SET is_admin = NOT is_admin WHERE community_id = ? AND user_id = ?",
				)
				.bind(community.as_str())
				.bind(user_id.as_str())
				.execute(&mut *tx)
				.await?;
				if done.rows_affected() == 0 {
					return Err(StoreError::MemberNotFound(user_id.clone()));
				}

				let (is_admin,): (bool,) =
					sqlx::query_as("SELECT is_admin FROM community_members WHERE community_id = ? AND user_id = ?")
						.bind(community.as_str())
						.bind(user_id.as_str())
						.fetch_one(&mut *tx)
						.await?;

				tx.commit().await?;
				Ok(is_admin)
			}
			StoreBackend::Postgres(pool) => {
				let row: Option<(bool,)> = sqlx::query_as(
					"UPDATE community_members SET is_admin = NOT is_admin \
					WHERE community_id = $1 AND user_id = $2 RETURNING is_admin",
				)
				.bind(community.as_str())
				.bind(user_id.as_str())
				.fetch_optional(pool)
				.await?;

				match row {
					Some((is_admin,)) => Ok(is_admin),
					None => Err(StoreError::MemberNotFound(user_id.clone())),
				}
			}
		}
	}

	/// Look up a member's community-admin bit; `None` when not on the roster.
	pub async fn member_is_admin(&self, community: &CommunityId, user_id: &UserId) -> Result<Option<bool>, StoreError> {
		let row: Option<(bool,)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT is_admin FROM community_members WHERE community_id = ? AND user_id = ?")
					.bind(community.as_str())
					.bind(user_id.as_str())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT is_admin FROM community_members WHERE community_id = $1 AND user_id = $2")
					.bind(community.as_str())
					.bind(user_id.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		Ok(row.map(|(is_admin,)| is_admin))
	}

	async fn community_exists(&self, id: &CommunityId) -> Result<bool, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id FROM communities WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id FROM communities WHERE id = $1")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		Ok(row.is_some())
	}
}
