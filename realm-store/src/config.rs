//! Realm configuration.
//!
//! A realm names the tables and columns the store reads from. Every option has
//! a default matching the conventional `user` / `role` / `user_roles` layout,
//! so an empty realm block is valid.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::Result;

const DEPRECATED_ALIASES: [(&str, &str); 3] = [
    ("users_table", "users_source"),
    ("roles_table", "roles_source"),
    ("user_roles_table", "user_roles_source"),
];

/// The three entities a realm is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// The users table.
    User,
    /// The roles table.
    Role,
    /// The join table linking users to roles.
    UserRole,
}

/// Options for a single authentication realm.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Realm name, recorded on log spans.
    pub realm: String,

    /// Users table.
    pub users_source: String,
    /// Roles table.
    pub roles_source: String,
    /// Join table between users and roles.
    pub user_roles_source: String,

    /// Entity class for users, overriding the name derived from
    /// `users_source`.
    pub users_resultset: Option<String>,
    /// Entity class for roles.
    pub roles_resultset: Option<String>,
    /// Entity class for the join table.
    pub user_roles_resultset: Option<String>,

    /// Login identifier column.
    pub users_username_column: String,
    /// Password hash column.
    pub users_password_column: String,
    /// Role name column.
    pub roles_role_column: String,
    /// Last login timestamp column.
    pub users_lastlogin_column: String,
    /// Password changed timestamp column. Password expiry needs it.
    pub users_pwchanged_column: Option<String>,
    /// Password reset code column.
    pub users_pwresetcode_column: String,

    /// Days after which a password is considered expired.
    pub password_expiry_days: Option<u32>,

    /// Extra conditions every user row must satisfy, e.g. `{"deleted": 0}`.
    ///
    /// Scalars compare with `=`, `null` with `IS NULL` and arrays with `IN`.
    pub user_valid_conditions: Map<String, Value>,

    /// When set, user details carry a `role name -> true` map under this key.
    pub roles_key: Option<String>,

    /// Database schema holding the tables. Defaults to `main`.
    pub schema_name: Option<String>,

    /// Algorithm handed to the password hasher.
    pub encryption_algorithm: String,

    /// Turns off role discovery and every role operation.
    pub disable_roles: bool,

    /// Names the users -> join table relationship instead of discovering it.
    pub user_user_roles_relationship: Option<String>,
    /// Names the roles -> join table relationship instead of discovering it.
    pub role_user_roles_relationship: Option<String>,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            realm: "default".to_string(),
            users_source: "user".to_string(),
            roles_source: "role".to_string(),
            user_roles_source: "user_roles".to_string(),
            users_resultset: None,
            roles_resultset: None,
            user_roles_resultset: None,
            users_username_column: "username".to_string(),
            users_password_column: "password".to_string(),
            roles_role_column: "role".to_string(),
            users_lastlogin_column: "lastlogin".to_string(),
            users_pwchanged_column: None,
            users_pwresetcode_column: "pw_reset_code".to_string(),
            password_expiry_days: None,
            user_valid_conditions: Map::new(),
            roles_key: None,
            schema_name: None,
            encryption_algorithm: "SHA-512".to_string(),
            disable_roles: false,
            user_user_roles_relationship: None,
            role_user_roles_relationship: None,
        }
    }
}

impl RealmConfig {
    /// Builds a realm from a host configuration block.
    ///
    /// The deprecated `users_table`, `roles_table` and `user_roles_table`
    /// options are honoured, with a warning, when the matching `_source`
    /// option is absent.
    pub fn from_value(value: Value) -> Result<Self> {
        let value = match value {
            Value::Object(mut options) => {
                for (old, new) in DEPRECATED_ALIASES {
                    let Some(aliased) = options.remove(old) else {
                        continue;
                    };

                    if options.contains_key(new) {
                        tracing::warn!("{old} is deprecated and ignored because {new} is set");
                    } else {
                        tracing::warn!("{old} is deprecated, use {new} instead");
                        options.insert(new.to_string(), aliased);
                    }
                }
                Value::Object(options)
            }
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        Ok(serde_json::from_value(value)?)
    }

    /// Table name for the given entity.
    pub fn source(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::User => &self.users_source,
            EntityKind::Role => &self.roles_source,
            EntityKind::UserRole => &self.user_roles_source,
        }
    }

    /// Entity class for the given entity: the explicit override when set,
    /// otherwise the camel-cased source.
    pub fn resultset(&self, kind: EntityKind) -> String {
        let explicit = match kind {
            EntityKind::User => &self.users_resultset,
            EntityKind::Role => &self.roles_resultset,
            EntityKind::UserRole => &self.user_roles_resultset,
        };

        explicit
            .clone()
            .unwrap_or_else(|| camelize(self.source(kind)))
    }

    /// Configured relationship name from `kind` to the join table, if any.
    pub fn relationship_override(&self, kind: EntityKind) -> Option<&str> {
        match kind {
            EntityKind::User => self.user_user_roles_relationship.as_deref(),
            EntityKind::Role => self.role_user_roles_relationship.as_deref(),
            EntityKind::UserRole => None,
        }
    }

    /// Schema the tables live in.
    pub fn schema_name(&self) -> &str {
        self.schema_name.as_deref().unwrap_or("main")
    }
}

/// Turns a table name into an entity class name: `user_roles` -> `UserRoles`.
pub fn camelize(source: &str) -> String {
    source
        .split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = RealmConfig::from_value(json!({})).unwrap();

        assert_eq!(config.source(EntityKind::User), "user");
        assert_eq!(config.source(EntityKind::Role), "role");
        assert_eq!(config.source(EntityKind::UserRole), "user_roles");
        assert_eq!(config.users_username_column, "username");
        assert_eq!(config.users_password_column, "password");
        assert_eq!(config.roles_role_column, "role");
        assert_eq!(config.users_lastlogin_column, "lastlogin");
        assert_eq!(config.users_pwresetcode_column, "pw_reset_code");
        assert_eq!(config.users_pwchanged_column, None);
        assert_eq!(config.password_expiry_days, None);
        assert_eq!(config.encryption_algorithm, "SHA-512");
        assert_eq!(config.schema_name(), "main");
        assert!(config.user_valid_conditions.is_empty());
    }

    #[test]
    fn test_null_block_is_default() {
        let config = RealmConfig::from_value(Value::Null).unwrap();
        assert_eq!(config.realm, "default");
    }

    #[test]
    fn test_resultset_derivation() {
        let config = RealmConfig::default();
        assert_eq!(config.resultset(EntityKind::User), "User");
        assert_eq!(config.resultset(EntityKind::UserRole), "UserRoles");

        let config = RealmConfig {
            users_resultset: Some("Account".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resultset(EntityKind::User), "Account");
    }

    #[test]
    fn test_deprecated_alias_applies_when_source_absent() {
        let config = RealmConfig::from_value(json!({
            "users_table": "accounts",
            "roles_table": "groups",
        }))
        .unwrap();

        assert_eq!(config.users_source, "accounts");
        assert_eq!(config.roles_source, "groups");
        assert_eq!(config.user_roles_source, "user_roles");
    }

    #[test]
    fn test_deprecated_alias_ignored_when_source_present() {
        let config = RealmConfig::from_value(json!({
            "users_table": "accounts",
            "users_source": "members",
        }))
        .unwrap();

        assert_eq!(config.users_source, "members");
    }

    #[test]
    fn test_invalid_block() {
        let err = RealmConfig::from_value(json!({ "password_expiry_days": "soon" }));
        assert!(matches!(err, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_camelize() {
        assert_eq!(camelize("user"), "User");
        assert_eq!(camelize("user_roles"), "UserRoles");
        assert_eq!(camelize("__odd__name"), "OddName");
    }
}
