//! The SQL credential store.
//!
//! Every mutation is a sequence of independent statements. No transaction is
//! opened, so a failure halfway through a role update leaves the roles
//! processed so far applied. Concurrent updates of one user are last writer
//! wins.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use crate::{
    backend::{AuthnBackend, AuthzBackend, UserId},
    config::RealmConfig,
    password::{PasswordHasher, SaltedDigest},
    query::{bind, decode_row, qualified, quote, truthy, Conditions},
    schema::{Layout, RoleBindings, Schema},
    user::{format_timestamp, User},
    Error, Result,
};

const ROLE_ALIAS: &str = "__realm_store_role";

/// Generic field names understood by [`CredentialStore::create_user`] and
/// [`CredentialStore::update_user`].
const USERNAME_FIELD: &str = "username";
const PASSWORD_FIELD: &str = "password";
const RESET_CODE_FIELD: &str = "pw_reset_code";

/// The column a user is looked up by.
///
/// `"username"` and `"reset-code"` convert to the configured username and
/// reset code columns, any other string names a column directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The configured username column.
    Username,
    /// The configured reset code column.
    ResetCode,
    /// Any other column.
    Column(&'a str),
}

impl<'a> From<&'a str> for Lookup<'a> {
    fn from(column: &'a str) -> Self {
        match column {
            "username" => Lookup::Username,
            "reset-code" => Lookup::ResetCode,
            other => Lookup::Column(other),
        }
    }
}

impl<'a> Lookup<'a> {
    fn column<'c>(self, config: &'c RealmConfig) -> &'c str
    where
        'a: 'c,
    {
        match self {
            Lookup::Username => &config.users_username_column,
            Lookup::ResetCode => &config.users_pwresetcode_column,
            Lookup::Column(column) => column,
        }
    }
}

/// Options for [`CredentialStore::find_user`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Load the names of the roles the user holds along with the row.
    pub prefetch_roles: bool,
}

/// A raw user row.
#[derive(Clone, PartialEq)]
pub struct UserRow {
    /// Every column of the row.
    pub columns: Map<String, Value>,
    /// Role names in join order, when prefetched and roles are enabled.
    pub roles: Option<Vec<String>>,
}

impl fmt::Debug for UserRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRow")
            .field("columns", &self.columns.keys().collect::<Vec<_>>())
            .field("roles", &self.roles)
            .finish()
    }
}

/// Username and password, e.g. from a login form.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    /// The login identifier.
    pub username: String,
    /// The plaintext password.
    pub password: SecretString,
}

/// Users, roles and credentials of one realm, stored in SQLite.
///
/// Table and column names come from [`RealmConfig`]. How users relate to
/// roles is discovered from the schema's foreign keys the first time it is
/// needed and kept for the life of the store; clones share it.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    pool: SqlitePool,
    config: Arc<RealmConfig>,
    hasher: Box<dyn PasswordHasher>,
    layout: Arc<OnceCell<Layout>>,
}

impl CredentialStore {
    /// Creates a store over the provided pool.
    ///
    /// Nothing is queried until the first operation; use
    /// [`init`](Self::init) to surface schema problems up front.
    pub fn new(pool: SqlitePool, config: RealmConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            hasher: Box::new(SaltedDigest::new()),
            layout: Arc::new(OnceCell::new()),
        }
    }

    /// Replaces the password hasher.
    pub fn with_hasher(mut self, hasher: impl PasswordHasher + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    /// The realm configuration.
    pub fn config(&self) -> &RealmConfig {
        &self.config
    }

    /// Resolves the configured tables and discovers the role relationships.
    pub async fn init(&self) -> Result {
        self.layout().await.map(|_| ())
    }

    /// Whether role operations are available.
    pub async fn roles_supported(&self) -> Result<bool> {
        Ok(self.layout().await?.roles.is_some())
    }

    async fn layout(&self) -> Result<&Layout> {
        self.layout
            .get_or_try_init(|| async {
                let schema = Schema::introspect(&self.pool, self.config.schema_name()).await?;
                Layout::resolve(&schema, &self.config)
            })
            .await
    }

    fn valid_user(&self, alias: Option<&str>, username: &str) -> Conditions {
        let mut conditions = Conditions::new();
        conditions.push_all(alias, &self.config.user_valid_conditions);
        conditions.push(
            alias,
            &self.config.users_username_column,
            &Value::from(username),
        );
        conditions
    }

    /// Finds the first valid user whose `lookup` column equals `value`.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm), err)]
    pub async fn find_user(
        &self,
        lookup: Lookup<'_>,
        value: impl Into<Value>,
        options: FindOptions,
    ) -> Result<Option<UserRow>> {
        let value = value.into();
        let layout = self.layout().await?;

        let mut conditions = Conditions::new();
        conditions.push_all(Some("u"), &self.config.user_valid_conditions);
        conditions.push(Some("u"), lookup.column(&self.config), &value);

        let users = qualified(&layout.schema, &layout.users);
        let bindings = layout.roles.as_ref().filter(|_| options.prefetch_roles);

        let Some(bindings) = bindings else {
            let sql = format!(
                "SELECT u.* FROM {users} AS u WHERE {} LIMIT 1",
                conditions.sql()
            );
            let row = conditions
                .bind(sqlx::query(&sql))
                .fetch_optional(&self.pool)
                .await?;

            return match row {
                Some(row) => Ok(Some(UserRow {
                    columns: decode_row(&row)?,
                    roles: None,
                })),
                None => Ok(None),
            };
        };

        let sql = format!(
            "SELECT u.*, r.{role} AS {alias} \
             FROM (SELECT * FROM {users} AS u WHERE {where_clause} LIMIT 1) AS u \
             LEFT JOIN {join} AS ur ON ur.{user_join} = u.{user_key} \
             LEFT JOIN {roles} AS r ON r.{role_key} = ur.{role_join}",
            role = quote(&self.config.roles_role_column),
            alias = quote(ROLE_ALIAS),
            where_clause = conditions.sql(),
            join = qualified(&layout.schema, &bindings.join_table),
            user_join = quote(&bindings.user.join_column),
            user_key = quote(&bindings.user.key_column),
            roles = qualified(&layout.schema, &bindings.role.table),
            role_key = quote(&bindings.role.key_column),
            role_join = quote(&bindings.role.join_column),
        );

        let mut rows = conditions.bind(sqlx::query(&sql)).fetch(&self.pool);
        let mut found: Option<UserRow> = None;

        while let Some(row) = rows.try_next().await? {
            let mut columns = decode_row(&row)?;
            let role = columns.remove(ROLE_ALIAS);

            let user = found.get_or_insert_with(|| UserRow {
                columns,
                roles: Some(Vec::new()),
            });

            let role = match role {
                Some(Value::String(role)) => role,
                Some(Value::Null) | None => continue,
                Some(other) => other.to_string(),
            };
            user.roles.get_or_insert_with(Vec::new).push(role);
        }

        Ok(found)
    }

    /// Loads a user's details.
    ///
    /// The password-changed column is parsed when configured, and when a
    /// roles key is configured the roles the user holds are attached.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name = username), err)]
    pub async fn get_user_details(&self, username: &str) -> Result<Option<User>> {
        let options = FindOptions {
            prefetch_roles: self.config.roles_key.is_some(),
        };

        let Some(row) = self.find_user(Lookup::Username, username, options).await? else {
            tracing::debug!("no such user");
            return Ok(None);
        };

        Ok(Some(User::from_row(&self.config, row.columns, row.roles)))
    }

    /// Returns the username holding the given password reset code.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm), err)]
    pub async fn get_user_by_reset_code(&self, code: &str) -> Result<Option<String>> {
        let row = self
            .find_user(Lookup::ResetCode, code, FindOptions::default())
            .await?;

        Ok(row.and_then(|row| {
            row.columns
                .get(&self.config.users_username_column)
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }

    /// Checks a password against the stored hash.
    ///
    /// On success the last-login column, when the users table has one, is
    /// set to now and the user, as read before that update, is returned. Its
    /// [`last_login`](User::last_login) is therefore the previous login.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name = username), err)]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<User>> {
        let Some(user) = self.get_user_details(username).await? else {
            return Ok(None);
        };

        let Some(stored) = user.password_hash() else {
            tracing::debug!("user has no password");
            return Ok(None);
        };

        if !self.hasher.matches(password, stored) {
            tracing::debug!("password mismatch");
            return Ok(None);
        }

        // Rows carry every column, so an absent key means no such column.
        let column = &self.config.users_lastlogin_column;
        if user.get(column).is_none() {
            tracing::debug!(column = %column, "users table has no last login column");
            return Ok(Some(user));
        }

        let mut fields = Map::new();
        fields.insert(
            column.clone(),
            Value::String(format_timestamp(OffsetDateTime::now_utc())),
        );
        self.write_user(username, fields).await?;

        Ok(Some(user))
    }

    /// Hashes and stores a new password, stamping the password-changed
    /// column when one is configured.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name = username), err)]
    pub async fn set_user_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<User>> {
        let fields = self.password_columns(password)?;
        self.write_user(username, fields).await
    }

    fn password_columns(&self, password: &SecretString) -> Result<Map<String, Value>> {
        let hash = self
            .hasher
            .encrypt(password, &self.config.encryption_algorithm)?;

        let mut fields = Map::new();
        fields.insert(
            self.config.users_password_column.clone(),
            Value::String(hash),
        );
        if let Some(column) = &self.config.users_pwchanged_column {
            fields.insert(
                column.clone(),
                Value::String(format_timestamp(OffsetDateTime::now_utc())),
            );
        }

        Ok(fields)
    }

    /// Whether the user's password is older than `password_expiry_days`.
    ///
    /// Always `false` without an expiry policy. A user whose password was
    /// never changed is treated as expired.
    pub fn password_expired(&self, user: &User) -> Result<bool> {
        let Some(days) = self.config.password_expiry_days else {
            return Ok(false);
        };

        if self.config.users_pwchanged_column.is_none() {
            return Err(Error::ExpiryWithoutPwChanged);
        }

        let Some(changed) = user.password_changed() else {
            return Ok(true);
        };

        let age = OffsetDateTime::now_utc() - changed;
        Ok(age.whole_days() > i64::from(days))
    }

    /// Creates a user.
    ///
    /// `fields` must carry a `username`. The remaining fields are applied as
    /// by [`update_user`](Self::update_user), so a `password` field is
    /// hashed.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name), err)]
    pub async fn create_user(&self, mut fields: Map<String, Value>) -> Result<Option<User>> {
        let username = match fields.remove(USERNAME_FIELD) {
            Some(Value::String(username)) if !username.is_empty() => username,
            _ => return Err(Error::MissingUsername),
        };
        tracing::Span::current().record("user.name", username.as_str());

        // Checked before the insert so a bad password leaves no row behind.
        let password = take_password(&mut fields)?;

        let layout = self.layout().await?;

        let mut columns = vec![quote(&self.config.users_username_column)];
        let mut values = vec![Value::String(username.clone())];
        for (column, value) in &self.config.user_valid_conditions {
            if !value.is_null() && !value.is_array() {
                columns.push(quote(column));
                values.push(value.clone());
            }
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(&layout.schema, &layout.users),
            columns.join(", "),
            vec!["?"; values.len()].join(", ")
        );
        values
            .iter()
            .fold(sqlx::query(&sql), bind)
            .execute(&self.pool)
            .await?;

        if let Some(password) = password {
            fields.extend(self.password_columns(&password)?);
        }

        self.write_user(&username, fields).await
    }

    /// Updates a user and returns the refreshed details.
    ///
    /// Under the roles key, `fields` may carry the complete set of roles the
    /// user should hold, as `{"role": true}`; roles not held are added and
    /// held roles missing or false are removed. A `password` field is a
    /// plaintext password, hashed as by
    /// [`set_user_password`](Self::set_user_password). A `pw_reset_code`
    /// field is written to the configured reset code column. Every other
    /// field is a column. Renaming the user through the username column is
    /// supported.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name = username), err)]
    pub async fn update_user(
        &self,
        username: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Option<User>> {
        if username.is_empty() {
            return Err(Error::MissingUsername);
        }

        if let Some(password) = take_password(&mut fields)? {
            fields.extend(self.password_columns(&password)?);
        }

        self.write_user(username, fields).await
    }

    /// Applies `fields` to the user's row without interpreting a password.
    async fn write_user(
        &self,
        username: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Option<User>> {
        if username.is_empty() {
            return Err(Error::MissingUsername);
        }

        let layout = self.layout().await?;

        let desired_roles = self
            .config
            .roles_key
            .as_ref()
            .and_then(|key| fields.remove(key));
        let options = FindOptions {
            prefetch_roles: desired_roles.is_some(),
        };

        let Some(current) = self.find_user(Lookup::Username, username, options).await? else {
            tracing::debug!("no such user");
            return Ok(None);
        };

        if let Some(desired) = desired_roles {
            match &layout.roles {
                Some(bindings) => {
                    let held = current.roles.unwrap_or_default();
                    self.apply_roles(layout, bindings, username, held, &desired)
                        .await?;
                }
                None => tracing::debug!("roles are disabled, ignoring role changes"),
            }
        }

        if let Some(code) = fields.remove(RESET_CODE_FIELD) {
            fields.insert(self.config.users_pwresetcode_column.clone(), code);
        }

        if !fields.is_empty() {
            let assignments = fields
                .keys()
                .map(|column| format!("{} = ?", quote(column)))
                .collect::<Vec<_>>()
                .join(", ");
            let conditions = self.valid_user(None, username);

            let sql = format!(
                "UPDATE {} SET {assignments} WHERE {}",
                qualified(&layout.schema, &layout.users),
                conditions.sql()
            );
            let query = fields.values().fold(sqlx::query(&sql), bind);
            conditions.bind(query).execute(&self.pool).await?;
        }

        let username = match fields.get(&self.config.users_username_column) {
            Some(Value::String(renamed)) => renamed.as_str(),
            _ => username,
        };

        self.get_user_details(username).await
    }

    async fn apply_roles(
        &self,
        layout: &Layout,
        bindings: &RoleBindings,
        username: &str,
        held: Vec<String>,
        desired: &Value,
    ) -> Result {
        let held: BTreeSet<String> = held.into_iter().collect();
        let wanted: BTreeSet<String> = match desired {
            Value::Object(roles) => roles
                .iter()
                .filter(|(_, flag)| truthy(flag))
                .map(|(role, _)| role.clone())
                .collect(),
            Value::Array(roles) => roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Value::String(role) => BTreeSet::from([role.clone()]),
            _ => BTreeSet::new(),
        };

        for role in wanted.difference(&held) {
            self.add_role(layout, bindings, username, role).await?;
        }

        for role in held.difference(&wanted) {
            self.remove_role(layout, bindings, username, role).await?;
        }

        Ok(())
    }

    async fn add_role(
        &self,
        layout: &Layout,
        bindings: &RoleBindings,
        username: &str,
        role: &str,
    ) -> Result {
        let roles = qualified(&layout.schema, &bindings.role.table);
        let role_column = quote(&self.config.roles_role_column);

        let created = sqlx::query(&format!(
            "INSERT INTO {roles} ({role_column}) SELECT ? \
             WHERE NOT EXISTS (SELECT 1 FROM {roles} WHERE {role_column} = ?)"
        ))
        .bind(role)
        .bind(role)
        .execute(&self.pool)
        .await?;

        if created.rows_affected() > 0 {
            tracing::warn!(role, "created missing role");
        }

        let mut conditions = self.valid_user(Some("u"), username);
        conditions.push(Some("r"), &self.config.roles_role_column, &Value::from(role));

        let sql = format!(
            "INSERT INTO {join} ({user_join}, {role_join}) \
             SELECT u.{user_key}, r.{role_key} FROM {users} AS u, {roles} AS r \
             WHERE {where_clause}",
            join = qualified(&layout.schema, &bindings.join_table),
            user_join = quote(&bindings.user.join_column),
            role_join = quote(&bindings.role.join_column),
            user_key = quote(&bindings.user.key_column),
            role_key = quote(&bindings.role.key_column),
            users = qualified(&layout.schema, &bindings.user.table),
            where_clause = conditions.sql(),
        );
        conditions.bind(sqlx::query(&sql)).execute(&self.pool).await?;

        tracing::debug!(role, "added role");
        Ok(())
    }

    async fn remove_role(
        &self,
        layout: &Layout,
        bindings: &RoleBindings,
        username: &str,
        role: &str,
    ) -> Result {
        let user_conditions = self.valid_user(Some("u"), username);
        let mut role_conditions = Conditions::new();
        role_conditions.push(Some("r"), &self.config.roles_role_column, &Value::from(role));

        let sql = format!(
            "DELETE FROM {join} \
             WHERE {user_join} IN (SELECT u.{user_key} FROM {users} AS u WHERE {user_where}) \
             AND {role_join} IN (SELECT r.{role_key} FROM {roles} AS r WHERE {role_where})",
            join = qualified(&layout.schema, &bindings.join_table),
            user_join = quote(&bindings.user.join_column),
            user_key = quote(&bindings.user.key_column),
            users = qualified(&layout.schema, &bindings.user.table),
            user_where = user_conditions.sql(),
            role_join = quote(&bindings.role.join_column),
            role_key = quote(&bindings.role.key_column),
            roles = qualified(&layout.schema, &bindings.role.table),
            role_where = role_conditions.sql(),
        );

        let query = user_conditions.bind(sqlx::query(&sql));
        role_conditions.bind(query).execute(&self.pool).await?;

        tracing::debug!(role, "removed role");
        Ok(())
    }

    /// Lists the names of the roles a user holds, in join order.
    ///
    /// Returns `None` when the user does not exist or roles are disabled, as
    /// opposed to an empty list for a user without roles.
    #[tracing::instrument(level = "debug", skip_all, fields(realm = %self.config.realm, user.name = username), err)]
    pub async fn get_user_roles(&self, username: &str) -> Result<Option<Vec<String>>> {
        if !self.roles_supported().await? {
            tracing::debug!("roles are disabled");
            return Ok(None);
        }

        let options = FindOptions {
            prefetch_roles: true,
        };
        let Some(row) = self.find_user(Lookup::Username, username, options).await? else {
            tracing::debug!("no such user");
            return Ok(None);
        };

        Ok(Some(row.roles.unwrap_or_default()))
    }
}

/// Removes the generic password field. `null` means no password.
fn take_password(fields: &mut Map<String, Value>) -> Result<Option<SecretString>> {
    match fields.remove(PASSWORD_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(password)) => Ok(Some(SecretString::new(password))),
        Some(_) => Err(Error::InvalidPassword),
    }
}

#[async_trait]
impl AuthnBackend for CredentialStore {
    type User = User;
    type Credentials = Credentials;
    type Error = Error;

    async fn authenticate(&self, creds: Self::Credentials) -> Result<Option<Self::User>> {
        CredentialStore::authenticate(self, &creds.username, &creds.password).await
    }

    async fn get_user(&self, user_id: &UserId<Self>) -> Result<Option<Self::User>> {
        self.get_user_details(user_id).await
    }
}

#[async_trait]
impl AuthzBackend for CredentialStore {
    type Role = String;

    async fn get_roles(&self, user: &Self::User) -> Result<HashSet<Self::Role>> {
        let roles = self.get_user_roles(user.username()).await?;
        Ok(roles.unwrap_or_default().into_iter().collect())
    }
}
