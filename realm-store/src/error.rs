use crate::config::EntityKind;

/// Errors raised by the credential store.
///
/// Lookups that find nothing are not errors: they return `Ok(None)`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A variant to map `sqlx` errors.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The realm configuration could not be deserialized.
    #[error("invalid realm configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A user was created or updated without a username.
    #[error("a username is required to create or update a user")]
    MissingUsername,

    /// A `password` field was given that is not a string.
    #[error("the password field must be a string")]
    InvalidPassword,

    /// Password expiry is configured but there is nowhere to read the
    /// password-changed time from.
    #[error("password_expiry_days requires users_pwchanged_column to be set")]
    ExpiryWithoutPwChanged,

    /// More than one relationship qualifies as the link to the join entity.
    #[error("{entity} has more than one relationship to {join}: {candidates:?}")]
    AmbiguousRelationship {
        /// The entity whose relationships were scanned.
        entity: String,
        /// The join entity.
        join: String,
        /// Names of every qualifying relationship.
        candidates: Vec<String>,
    },

    /// No relationship qualifies as the link to the join entity.
    #[error("{entity} has no single-column has-many relationship to {join}")]
    MissingRelationship {
        /// The entity whose relationships were scanned.
        entity: String,
        /// The join entity.
        join: String,
    },

    /// The configured resultset names no table in the schema.
    #[error("no entity named {class} for {kind:?} in schema {schema}")]
    UnknownEntity {
        /// Which side of the model was being resolved.
        kind: EntityKind,
        /// The class name that was looked up.
        class: String,
        /// The database schema searched.
        schema: String,
    },

    /// The named hashing algorithm is not supported.
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The system random source failed while generating a salt.
    #[error("failed to generate password salt")]
    Hashing,
}

/// Result type used throughout the crate.
pub type Result<T = ()> = std::result::Result<T, Error>;
