use std::{collections::BTreeMap, fmt};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    OffsetDateTime, PrimitiveDateTime,
};

use crate::{backend::AuthUser, config::RealmConfig};

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const TIMESTAMP_PARSE: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
);

/// Formats a timestamp the way it is written to timestamp columns, e.g.
/// `2024-03-01 12:30:00`, in UTC.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    at.format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Parses a timestamp column value.
///
/// Accepts SQLite `datetime()` text, RFC 3339 and integer Unix seconds.
pub fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => PrimitiveDateTime::parse(text, TIMESTAMP_PARSE)
            .map(PrimitiveDateTime::assume_utc)
            .or_else(|_| OffsetDateTime::parse(text, &Rfc3339))
            .ok(),
        Value::Number(number) => OffsetDateTime::from_unix_timestamp(number.as_i64()?).ok(),
        _ => None,
    }
}

/// A user row as returned by the store.
///
/// Holds every column of the row. When a password-changed column is
/// configured its value is also available parsed, and when a roles key is
/// configured the roles the user held at read time are attached.
#[derive(Clone, PartialEq)]
pub struct User {
    username: String,
    columns: Map<String, Value>,
    password_column: String,
    lastlogin_column: String,
    password_changed: Option<(String, OffsetDateTime)>,
    roles: Option<(String, BTreeMap<String, bool>)>,
}

impl User {
    pub(crate) fn from_row(
        config: &RealmConfig,
        columns: Map<String, Value>,
        roles: Option<Vec<String>>,
    ) -> Self {
        let username = match columns.get(&config.users_username_column) {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let password_changed = config.users_pwchanged_column.as_ref().and_then(|column| {
            let at = columns.get(column).and_then(parse_timestamp)?;
            Some((column.clone(), at))
        });

        let roles = config.roles_key.clone().zip(roles).map(|(key, held)| {
            let held = held.into_iter().map(|role| (role, true)).collect();
            (key, held)
        });

        Self {
            username,
            columns,
            password_column: config.users_password_column.clone(),
            lastlogin_column: config.users_lastlogin_column.clone(),
            password_changed,
            roles,
        }
    }

    /// The login identifier.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Raw value of a column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Every column of the row.
    pub fn columns(&self) -> &Map<String, Value> {
        &self.columns
    }

    /// The stored password hash, if any.
    pub fn password_hash(&self) -> Option<&str> {
        self.columns.get(&self.password_column)?.as_str()
    }

    /// The last login time as stored when the row was read.
    ///
    /// For a user returned by a successful authentication this is the
    /// previous login.
    pub fn last_login(&self) -> Option<OffsetDateTime> {
        self.columns
            .get(&self.lastlogin_column)
            .and_then(parse_timestamp)
    }

    /// When the password was last changed, if a password-changed column is
    /// configured and set.
    pub fn password_changed(&self) -> Option<OffsetDateTime> {
        self.password_changed.as_ref().map(|(_, at)| *at)
    }

    /// Roles held at read time, keyed by role name, when a roles key is
    /// configured and roles are enabled.
    pub fn roles(&self) -> Option<&BTreeMap<String, bool>> {
        self.roles.as_ref().map(|(_, roles)| roles)
    }

    /// The user as a flat JSON object: every column, the password-changed
    /// time in RFC 3339 and the role map under the configured roles key.
    pub fn to_value(&self) -> Value {
        let mut object = self.columns.clone();

        if let Some((column, at)) = &self.password_changed {
            if let Ok(formatted) = at.format(&Rfc3339) {
                object.insert(column.clone(), Value::String(formatted));
            }
        }

        if let Some((key, roles)) = &self.roles {
            let roles = roles
                .iter()
                .map(|(role, held)| (role.clone(), Value::Bool(*held)))
                .collect();
            object.insert(key.clone(), Value::Object(roles));
        }

        Value::Object(object)
    }
}

impl Serialize for User {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

// Implemented manually to keep the password hash out of logs.
impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns: BTreeMap<_, _> = self
            .columns
            .iter()
            .map(|(column, value)| {
                if column == &self.password_column {
                    (column.as_str(), Value::String("[redacted]".to_string()))
                } else {
                    (column.as_str(), value.clone())
                }
            })
            .collect();

        f.debug_struct("User")
            .field("username", &self.username)
            .field("columns", &columns)
            .field("roles", &self.roles())
            .finish()
    }
}

impl AuthUser for User {
    type Id = String;

    fn id(&self) -> Self::Id {
        self.username.clone()
    }

    fn session_auth_hash(&self) -> &[u8] {
        // Changing the password invalidates existing sessions.
        self.password_hash().unwrap_or_default().as_bytes()
    }
}
