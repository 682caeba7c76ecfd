mod common;

use std::time::Duration;

use common::TempDir;
use feedhook_core::{Role, UserError, UserStore};

fn store(tmp: &TempDir) -> UserStore {
    UserStore::open(tmp.data_dir().users(), Duration::from_secs(5)).with_cost(4)
}

#[tokio::test]
async fn owner_setup_happens_once() {
    let tmp = TempDir::new("setup");
    let users = store(&tmp);
    assert!(!users.is_set_up().await.unwrap());

    let owner = users.setup_owner("root", "hunter22").await.unwrap();
    assert_eq!(owner.role, Role::Owner);
    assert!(owner.password.starts_with("$2"));
    assert!(users.is_set_up().await.unwrap());

    assert!(matches!(
        users.setup_owner("again", "pw").await,
        Err(UserError::AlreadySetUp)
    ));
}

#[tokio::test]
async fn credentials_are_verified_against_bcrypt() {
    let tmp = TempDir::new("verify");
    let users = store(&tmp);
    users.setup_owner("root", "hunter22").await.unwrap();

    assert!(users.verify("root", "hunter22").await.unwrap().is_some());
    assert!(users.verify("root", "wrong").await.unwrap().is_none());
    assert!(users.verify("nobody", "hunter22").await.unwrap().is_none());
}

#[tokio::test]
async fn roles_and_deletion_rules() {
    let tmp = TempDir::new("roles");
    let users = store(&tmp);
    let owner = users.setup_owner("root", "pw").await.unwrap();
    let admin = users.add_user("alice", "pw", Role::Admin).await.unwrap();

    assert!(matches!(
        users.add_user("alice", "pw", Role::Admin).await,
        Err(UserError::Duplicate(_))
    ));
    assert!(matches!(
        users.add_user("eve", "pw", Role::Owner).await,
        Err(UserError::Forbidden(_))
    ));

    let promoted = users.set_role(&admin.id, Role::SuperAdmin).await.unwrap();
    assert_eq!(promoted.role, Role::SuperAdmin);
    assert!(users.set_role(&owner.id, Role::Admin).await.is_err());

    assert!(matches!(users.delete(&owner.id).await, Err(UserError::Forbidden(_))));
    users.delete(&admin.id).await.unwrap();
    assert_eq!(users.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn password_change_requires_current_password() {
    let tmp = TempDir::new("password");
    let users = store(&tmp);
    let owner = users.setup_owner("root", "old").await.unwrap();

    assert!(users.change_password(&owner.id, "bad", "new").await.is_err());
    users.change_password(&owner.id, "old", "new").await.unwrap();
    assert!(users.verify("root", "new").await.unwrap().is_some());
    assert!(users.verify("root", "old").await.unwrap().is_none());
}

#[tokio::test]
async fn legacy_hash_needs_reset() {
    let tmp = TempDir::new("legacy_hash");
    let path = tmp.data_dir().users();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        br#"{"id":"1","username":"root","password":"5e884898da28047151d0e56f8dc62927","role":"owner"}"#,
    )
    .unwrap();

    let users = store(&tmp);
    assert_eq!(users.list().await.unwrap().len(), 1);
    assert!(users.verify("root", "password").await.unwrap().is_none());

    users.reset_password("1", "password").await.unwrap();
    assert!(users.verify("root", "password").await.unwrap().is_some());
}

#[tokio::test]
async fn user_backup_restore_promotes_first_user() {
    let tmp = TempDir::new("user_backup");
    let users = store(&tmp);
    let count = users
        .import(br#"[{"id":"1","username":"a","password":"$2b$04$x"},{"id":"2","username":"b","password":"$2b$04$y","role":"super_admin"}]"#)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let restored = users.list().await.unwrap();
    assert_eq!(restored[0].role, Role::Owner);
    assert_eq!(restored[1].role, Role::SuperAdmin);

    let exported = users.export().await.unwrap();
    let other = TempDir::new("user_restore");
    assert_eq!(store(&other).import(&exported).await.unwrap(), 2);

    assert!(matches!(
        users.import(br#"[{"username":"x"}]"#).await,
        Err(UserError::InvalidBackup(_))
    ));
}
