//! User directory lookups.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Role, User, UserId};

impl super::Db {
    /// Look up a user by id.
    pub async fn get_user(&self, id: UserId) -> Result<User> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, name, email, role FROM users WHERE id = $1")
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("user {id}")))?
            .try_into_user()
    }

    /// Any manager other than `exclude`, picking the one with the fewest
    /// open escalations so assignments spread out.
    pub async fn find_manager_excluding(&self, exclude: UserId) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT u.id, u.name, u.email, u.role FROM users u
             LEFT JOIN followups f ON f.manager_id = u.id AND f.status = 'no_response'
             WHERE u.role = 'manager' AND u.id <> $1
             GROUP BY u.id, u.name, u.email, u.role
             ORDER BY COUNT(f.id) ASC, u.name ASC
             LIMIT 1",
        )
        .bind(exclude.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(UserRow::try_into_user).transpose()
    }

    /// Insert or update a directory entry.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, email, role) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email, role = EXCLUDED.role",
        )
        .bind(user.id.0)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.role.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    role: String,
}

impl UserRow {
    fn try_into_user(self) -> Result<User> {
        Ok(User {
            id: UserId(self.id),
            name: self.name,
            email: self.email,
            role: self.role.parse::<Role>()?,
        })
    }
}
