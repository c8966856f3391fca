#![forbid(unsafe_code)]

//! SQL persistence for communities, message collections and reports.
//!
//! Every mutation is either a single conditional statement or a short
//! transaction, so concurrent verbs from different connections never race
//! through a read-modify-write window.

use anyhow::{Context, anyhow};
use homeroom_domain::{
	Community, CommunityId, FileAttachment, MessageId, ReportedMessage, RosterEntry, StoredMessage, UserId,
};

mod communities;
mod messages;
mod reports;


pub use reports::UnflagOutcome;

/// Storage errors surfaced to the action layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("community not found: {0}")]
	CommunityNotFound(CommunityId),

	#[error("community already exists: {0}")]
	CommunityExists(CommunityId),

	#[error("member not found: {0}")]
	MemberNotFound(UserId),

	#[error("message collection already exists for community: {0}")]
	CollectionExists(CommunityId),

	#[error("message not found: {0}")]
	MessageNotFound(MessageId),

	#[error("message already flagged: {0}")]
	AlreadyFlagged(MessageId),

	#[error("message not flagged: {0}")]
	NotFlagged(MessageId),

	#[error("no report on file for message: {0}")]
	ReportNotFound(MessageId),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error(transparent)]
	Database(#[from] sqlx::Error),
}

/// Handle over the configured SQL backend.
#[derive(Clone)]
pub struct Store {
	backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl Store {
	/// Connect to `database_url` and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// In-memory sqlite lives and dies with its connection; pin the
			// pool to one connection that never retires.
			let pool = if database_url.contains(":memory:") {
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: StoreBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: StoreBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[derive(sqlx::FromRow)]
struct MessageRow {
	id: String,
	community_id: String,
	user_id: String,
	user_name: String,
	user_profile_picture: Option<String>,
	text: Option<String>,
	file_name: Option<String>,
	file_content_type: Option<String>,
	file_url: Option<String>,
	flagged: bool,
	created_at_unix_ms: i64,
}

impl MessageRow {
	fn into_stored(self) -> Result<StoredMessage, StoreError> {
		let id = MessageId::parse(&self.id).map_err(|e| StoreError::Corrupt(format!("message id {:?}: {e}", self.id)))?;
		let community_id = CommunityId::new(self.community_id).map_err(|e| StoreError::Corrupt(format!("community id: {e}")))?;
		let user_id = UserId::new(self.user_id).map_err(|e| StoreError::Corrupt(format!("user id: {e}")))?;

		let file = self.file_url.map(|url| FileAttachment {
			name: self.file_name.unwrap_or_default(),
			content_type: self.file_content_type.unwrap_or_default(),
			url,
		});

		Ok(StoredMessage {
			id,
			community_id,
			user_id,
			user_name: self.user_name,
			user_profile_picture: self.user_profile_picture,
			text: self.text,
			file,
			flagged: self.flagged,
			created_at_unix_ms: self.created_at_unix_ms,
		})
	}
}

#[derive(sqlx::FromRow)]
struct ReportRow {
	group_name: String,
	group_id: String,
	message: String,
	message_id: String,
	reported_by: String,
	message_by: String,
	action_taken: bool,
	created_at_unix_ms: i64,
}

impl ReportRow {
	fn into_report(self) -> Result<ReportedMessage, StoreError> {
		Ok(ReportedMessage {
			group_name: self.group_name,
			community_id: CommunityId::new(self.group_id).map_err(|e| StoreError::Corrupt(format!("community id: {e}")))?,
			message: self.message,
			message_id: MessageId::parse(&self.message_id)
				.map_err(|e| StoreError::Corrupt(format!("message id {:?}: {e}", self.message_id)))?,
			reported_by: UserId::new(self.reported_by).map_err(|e| StoreError::Corrupt(format!("user id: {e}")))?,
			message_by: UserId::new(self.message_by).map_err(|e| StoreError::Corrupt(format!("user id: {e}")))?,
			action_taken: self.action_taken,
			created_at_unix_ms: self.created_at_unix_ms,
		})
	}
}

#[derive(sqlx::FromRow)]
struct MemberRow {
	user_id: String,
	name: String,
	phone: Option<String>,
	profile_picture: Option<String>,
	is_admin: bool,
}

impl MemberRow {
	fn into_entry(self) -> Result<RosterEntry, StoreError> {
		Ok(RosterEntry {
			user_id: UserId::new(self.user_id).map_err(|e| StoreError::Corrupt(format!("user id: {e}")))?,
			name: self.name,
			phone: self.phone,
			profile_picture: self.profile_picture,
			is_admin: self.is_admin,
		})
	}
}

#[derive(sqlx::FromRow)]
struct CommunityRow {
	id: String,
	name: String,
	state: String,
	city: String,
	builder: String,
	thumbnail: Option<String>,
	projects_json: String,
}

impl CommunityRow {
	fn into_community(self, members: Vec<RosterEntry>) -> Result<Community, StoreError> {
		let projects: Vec<String> = serde_json::from_str(&self.projects_json)
			.map_err(|e| StoreError::Corrupt(format!("projects for community {:?}: {e}", self.id)))?;

		Ok(Community {
			id: CommunityId::new(self.id).map_err(|e| StoreError::Corrupt(format!("community id: {e}")))?,
			name: self.name,
			state: self.state,
			city: self.city,
			builder: self.builder,
			thumbnail: self.thumbnail,
			projects,
			members,
		})
	}
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
