//! User directory abstraction and the in-memory implementation used in
//! development and tests.
//!
//! The gateway only reads users, links SSO identities, invalidates invites and
//! mints password reset tokens; everything else about accounts lives elsewhere.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier as _, password_hash::SaltString,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::sso::SsoIdentity;
use super::utils::generate_token;

/// Account attributes the gateway needs to make login decisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub name: Option<String>,
    pub email: String,
    /// Address the latest activation mail went to, when it differs from `email`.
    pub activation_email: Option<String>,
    pub password_hash: Option<String>,
    pub active: bool,
    pub email_confirmed: bool,
    pub approved: bool,
    pub admin: bool,
    pub suspended: bool,
    pub suspend_reason: Option<String>,
    pub suspended_till: Option<DateTime<Utc>>,
}

impl User {
    /// A fully activated, approved account without a password.
    #[must_use]
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            name: None,
            email: email.to_string(),
            activation_email: None,
            password_hash: None,
            active: true,
            email_confirmed: true,
            approved: true,
            admin: false,
            suspended: false,
            suspend_reason: None,
            suspended_till: None,
        }
    }

    #[must_use]
    pub fn sent_to_email(&self) -> &str {
        self.activation_email.as_deref().unwrap_or(&self.email)
    }

    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.active && self.email_confirmed
    }
}

/// Lookup and provisioning of user records.
///
/// Calls are single-attempt: implementations report failures instead of retrying.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Case-insensitive match on username or email.
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    /// Resolve an SSO identity to a local user, creating one when needed.
    ///
    /// `Ok(None)` means the identity cannot be mapped to an account.
    async fn lookup_or_create_from_sso(&self, identity: &SsoIdentity) -> Result<Option<User>>;

    /// Invalidate every pending invite addressed to `email`.
    async fn invalidate_invites_for_email(&self, email: &str) -> Result<()>;

    /// Mint a password reset token bound to the user's current email.
    async fn create_email_token(&self, user: &User) -> Result<String>;
}

/// Password verification capability.
pub trait PasswordVerifier: Send + Sync {
    fn confirm_password(&self, user: &User, password: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct Argon2Verifier;

impl PasswordVerifier for Argon2Verifier {
    fn confirm_password(&self, user: &User, password: &str) -> bool {
        let Some(stored) = user.password_hash.as_deref() else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Produce an Argon2id PHC string for `password`.
///
/// # Errors
/// Returns an error if the salt cannot be generated or hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut salt_bytes)
        .context("failed to generate password salt")?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|err| anyhow!("invalid salt: {err}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Pick a username for a new SSO account: the `username` claim, else the
/// local part of the email, restricted to `[A-Za-z0-9_.-]`.
pub(super) fn suggest_username(identity: &SsoIdentity) -> Option<String> {
    let source = identity
        .username
        .as_deref()
        .or_else(|| identity.email.as_deref().and_then(|e| e.split('@').next()))?;
    let cleaned: String = source
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Issued reset token as recorded by the in-memory directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailToken {
    pub user_id: Uuid,
    pub email: String,
    pub token: String,
}

#[derive(Debug, Default)]
struct DirectoryData {
    users: HashMap<Uuid, User>,
    sso_links: HashMap<String, Uuid>,
    pending_invites: HashSet<String>,
    email_tokens: Vec<EmailToken>,
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    data: RwLock<DirectoryData>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.data.write().await.users.insert(user.id, user);
    }

    pub async fn add_invite(&self, email: &str) {
        self.data
            .write()
            .await
            .pending_invites
            .insert(email.to_lowercase());
    }

    pub async fn has_pending_invite(&self, email: &str) -> bool {
        self.data
            .read()
            .await
            .pending_invites
            .contains(&email.to_lowercase())
    }

    pub async fn email_tokens(&self) -> Vec<EmailToken> {
        self.data.read().await.email_tokens.clone()
    }
}

fn find_login<'a>(users: &'a HashMap<Uuid, User>, login: &str) -> Option<&'a User> {
    users.values().find(|user| {
        user.username.eq_ignore_ascii_case(login) || user.email.eq_ignore_ascii_case(login)
    })
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>> {
        let data = self.data.read().await;
        Ok(find_login(&data.users, login).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.data.read().await.users.get(&id).cloned())
    }

    async fn lookup_or_create_from_sso(&self, identity: &SsoIdentity) -> Result<Option<User>> {
        let mut data = self.data.write().await;

        if let Some(user_id) = data.sso_links.get(&identity.external_id).copied() {
            return Ok(data.users.get(&user_id).cloned());
        }

        let Some(email) = identity.email.as_deref() else {
            return Ok(None);
        };

        let existing = data
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .map(|user| user.id);
        if let Some(user_id) = existing {
            data.sso_links.insert(identity.external_id.clone(), user_id);
            return Ok(data.users.get(&user_id).cloned());
        }

        let Some(base) = suggest_username(identity) else {
            return Ok(None);
        };
        let mut username = base.clone();
        let mut suffix = 1;
        while find_login(&data.users, &username).is_some() {
            username = format!("{base}{suffix}");
            suffix += 1;
        }

        let mut user = User::new(&username, email);
        user.name.clone_from(&identity.name);
        user.approved = false;
        user.admin = identity.admin;

        data.sso_links.insert(identity.external_id.clone(), user.id);
        data.users.insert(user.id, user.clone());
        Ok(Some(user))
    }

    async fn invalidate_invites_for_email(&self, email: &str) -> Result<()> {
        self.data
            .write()
            .await
            .pending_invites
            .remove(&email.to_lowercase());
        Ok(())
    }

    async fn create_email_token(&self, user: &User) -> Result<String> {
        let token = generate_token()?;
        self.data.write().await.email_tokens.push(EmailToken {
            user_id: user.id,
            email: user.email.clone(),
            token: token.clone(),
        });
        Ok(token)
    }
}
