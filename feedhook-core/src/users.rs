//! Dashboard accounts and roles.
//!
//! The store only holds data; permission decisions belong to the web layer,
//! which asks [`Role`] for its capabilities.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::UserError;
use crate::persist::LockedJsonFile;

/// Declaration order is privilege order: `Admin < SuperAdmin < Owner`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Admin,
    SuperAdmin,
    Owner,
}

impl Role {
    pub fn can_manage_users(self) -> bool {
        self >= Role::SuperAdmin
    }

    /// Whether an actor with this role may delete or reset the password of
    /// `target`. Nobody manages the owner; super admins manage admins only.
    pub fn can_manage(self, target: Role) -> bool {
        match self {
            Role::Owner => target < Role::Owner,
            Role::SuperAdmin => target == Role::Admin,
            Role::Admin => false,
        }
    }

    /// Roles this actor may hand out when creating an account.
    pub fn can_assign(self, role: Role) -> bool {
        self.can_manage(role)
    }

    pub fn can_change_roles(self) -> bool {
        self == Role::Owner
    }

    pub fn can_backup_users(self) -> bool {
        self == Role::Owner
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
            Role::Owner => "owner",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    /// bcrypt hash
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
struct UserList(#[serde(deserialize_with = "one_or_many")] Vec<User>);

// very old files held a single user object instead of a list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<User>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Many(Vec<User>),
        One(User),
    }
    Ok(match Shape::deserialize(deserializer)? {
        Shape::Many(users) => users,
        Shape::One(user) => vec![user],
    })
}

#[derive(Debug, Clone)]
pub struct UserStore {
    file: LockedJsonFile,
    cost: u32,
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            file: LockedJsonFile::new(path, lock_timeout).strict(),
            cost: bcrypt::DEFAULT_COST,
        }
    }

    /// bcrypt work factor; lower values are only sensible in tests.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub async fn list(&self) -> Result<Vec<User>, UserError> {
        let users: UserList = self.file.read().await?;
        Ok(users.0)
    }

    pub async fn is_set_up(&self) -> Result<bool, UserError> {
        Ok(!self.list().await?.is_empty())
    }

    pub async fn get(&self, user_id: &str) -> Result<User, UserError> {
        self.list()
            .await?
            .into_iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| UserError::NotFound(user_id.to_owned()))
    }

    async fn hash(&self, password: &str) -> Result<String, UserError> {
        let password = password.to_owned();
        let cost = self.cost;
        let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(crate::error::StoreError::from)??;
        Ok(hashed)
    }

    /// Creates the first account, which is always the owner.
    pub async fn setup_owner(&self, username: &str, password: &str) -> Result<User, UserError> {
        let hashed = self.hash(password).await?;
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_owned(),
            password: hashed,
            role: Role::Owner,
        };
        let created = user.clone();
        self.file
            .update(move |users: &mut UserList| {
                if !users.0.is_empty() {
                    return Err(UserError::AlreadySetUp);
                }
                users.0.push(user);
                Ok(())
            })
            .await??;
        info!(username = %created.username, "owner account created");
        Ok(created)
    }

    pub async fn add_user(&self, username: &str, password: &str, role: Role) -> Result<User, UserError> {
        if role == Role::Owner {
            return Err(UserError::Forbidden("there is only one owner"));
        }
        let hashed = self.hash(password).await?;
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_owned(),
            password: hashed,
            role,
        };
        let created = user.clone();
        self.file
            .update(move |users: &mut UserList| {
                if users.0.iter().any(|u| u.username == user.username) {
                    return Err(UserError::Duplicate(user.username.clone()));
                }
                users.0.push(user);
                Ok(())
            })
            .await??;
        Ok(created)
    }

    /// Returns the user when the credentials match.
    pub async fn verify(&self, username: &str, password: &str) -> Result<Option<User>, UserError> {
        let Some(user) = self.list().await?.into_iter().find(|u| u.username == username) else {
            return Ok(None);
        };
        let candidate = password.to_owned();
        let hash = user.password.clone();
        let matched = tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash))
            .await
            .map_err(crate::error::StoreError::from)?;
        match matched {
            Ok(true) => Ok(Some(user)),
            Ok(false) => Ok(None),
            Err(e) => {
                warn!(username = %username, error = %e, "stored password hash is not bcrypt; reset required");
                Ok(None)
            }
        }
    }

    /// Promotion admin -> super admin and demotion back; the owner is fixed.
    pub async fn set_role(&self, user_id: &str, role: Role) -> Result<User, UserError> {
        if role == Role::Owner {
            return Err(UserError::Forbidden("there is only one owner"));
        }
        self.file
            .update(|users: &mut UserList| {
                let user = users
                    .0
                    .iter_mut()
                    .find(|u| u.id == user_id)
                    .ok_or_else(|| UserError::NotFound(user_id.to_owned()))?;
                if user.role == Role::Owner {
                    return Err(UserError::Forbidden("the owner's role cannot change"));
                }
                user.role = role;
                Ok(user.clone())
            })
            .await?
    }

    pub async fn change_password(&self, user_id: &str, current: &str, new: &str) -> Result<(), UserError> {
        let user = self.get(user_id).await?;
        if self.verify(&user.username, current).await?.is_none() {
            return Err(UserError::Forbidden("current password is incorrect"));
        }
        self.reset_password(user_id, new).await
    }

    pub async fn reset_password(&self, user_id: &str, new: &str) -> Result<(), UserError> {
        let hashed = self.hash(new).await?;
        self.file
            .update(|users: &mut UserList| {
                let user = users
                    .0
                    .iter_mut()
                    .find(|u| u.id == user_id)
                    .ok_or_else(|| UserError::NotFound(user_id.to_owned()))?;
                user.password = hashed;
                Ok(())
            })
            .await?
    }

    pub async fn delete(&self, user_id: &str) -> Result<(), UserError> {
        self.file
            .update(|users: &mut UserList| {
                let idx = users
                    .0
                    .iter()
                    .position(|u| u.id == user_id)
                    .ok_or_else(|| UserError::NotFound(user_id.to_owned()))?;
                if users.0[idx].role == Role::Owner {
                    return Err(UserError::Forbidden("the owner cannot be deleted"));
                }
                users.0.remove(idx);
                Ok(())
            })
            .await?
    }

    pub async fn export(&self) -> Result<Vec<u8>, UserError> {
        Ok(self.file.read_bytes().await?)
    }

    /// Restores a user backup. A single legacy object is accepted, a missing
    /// role means admin, and without any owner the first user becomes owner.
    pub async fn import(&self, bytes: &[u8]) -> Result<usize, UserError> {
        let users = validate_backup(bytes)?;
        let count = users.len();
        let json = serde_json::to_vec_pretty(&users).map_err(crate::error::StoreError::from)?;
        self.file.replace_bytes(&json).await?;
        info!(count, "user database restored");
        Ok(count)
    }
}

fn validate_backup(bytes: &[u8]) -> Result<Vec<User>, UserError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| UserError::InvalidBackup(e.to_string()))?;
    let entries = match value {
        Value::Array(entries) => entries,
        other if other.get("username").is_some() => vec![other],
        _ => {
            return Err(UserError::InvalidBackup(
                "expected a list of users".to_owned(),
            ))
        }
    };

    let mut users = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        if ["id", "username", "password"].iter().any(|k| entry.get(*k).is_none()) {
            return Err(UserError::InvalidBackup(format!(
                "user entry missing required fields: {name}"
            )));
        }
        let user: User = serde_json::from_value(entry)
            .map_err(|e| UserError::InvalidBackup(format!("{name}: {e}")))?;
        users.push(user);
    }

    if users.is_empty() {
        return Err(UserError::InvalidBackup("backup contains no users".to_owned()));
    }
    if !users.iter().any(|u| u.role == Role::Owner) {
        users[0].role = Role::Owner;
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_strictly_ordered() {
        assert!(Role::Owner > Role::SuperAdmin);
        assert!(Role::SuperAdmin > Role::Admin);
        assert_eq!(
            serde_json::to_string(&Role::SuperAdmin).unwrap(),
            "\"super_admin\""
        );
    }

    #[test]
    fn capabilities_follow_hierarchy() {
        assert!(Role::Owner.can_manage(Role::SuperAdmin));
        assert!(!Role::Owner.can_manage(Role::Owner));
        assert!(Role::SuperAdmin.can_manage(Role::Admin));
        assert!(!Role::SuperAdmin.can_manage(Role::SuperAdmin));
        assert!(!Role::Admin.can_manage(Role::Admin));
        assert!(!Role::SuperAdmin.can_assign(Role::SuperAdmin));
        assert!(Role::Owner.can_backup_users());
        assert!(!Role::SuperAdmin.can_backup_users());
        assert!(!Role::Admin.can_manage_users());
    }

    #[test]
    fn backup_validation_fills_roles_and_owner() {
        let users = validate_backup(
            br#"[{"id":"1","username":"a","password":"h"},{"id":"2","username":"b","password":"h","role":"super_admin"}]"#,
        )
        .unwrap();
        assert_eq!(users[0].role, Role::Owner);
        assert_eq!(users[1].role, Role::SuperAdmin);

        let single = validate_backup(br#"{"id":"1","username":"a","password":"h","role":"owner"}"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(validate_backup(br#"[{"username":"a"}]"#).is_err());
        assert!(validate_backup(br#"{"FEEDS": []}"#).is_err());
    }
}
