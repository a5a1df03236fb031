//! Schema metadata and relationship discovery.
//!
//! Relationships are read from foreign keys: a key from child `C` to parent
//! `P` gives `P` a has-many relationship to `C` and `C` a belongs-to
//! relationship to `P`. Role support needs exactly one single-column has-many
//! relationship from the users entity and from the roles entity to the join
//! entity. The result is resolved once into a [`Layout`] of plain table and
//! column names.

use std::collections::BTreeMap;

use sqlx::{Row, SqlitePool};

use crate::{
    config::{camelize, EntityKind, RealmConfig},
    query::quote,
    Error, Result,
};

/// How many rows sit on the far side of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Zero or more rows of the target reference this entity.
    HasMany,
    /// This entity references one row of the target.
    BelongsTo,
}

/// The join used to follow a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Rows without a match are dropped.
    Inner,
    /// Rows without a match are kept.
    LeftOuter,
}

/// A named, directed relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Accessor name.
    pub name: String,
    /// Class of the target entity.
    pub class: String,
    /// Cardinality of the target side.
    pub cardinality: Cardinality,
    /// Join used to reach the target.
    pub join_type: JoinType,
    /// `(target column, own column)` pairs of the join condition.
    pub columns: Vec<(String, String)>,
}

/// A table and the relationships declared on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Class name, the camel-cased table name.
    pub class: String,
    /// Table name.
    pub table: String,
    /// Relationships from this entity, in declaration order.
    pub relationships: Vec<Relationship>,
}

impl Entity {
    /// Creates an entity without relationships.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            class: camelize(&table),
            table,
            relationships: Vec::new(),
        }
    }

    fn relationship_named(&self, name: &str) -> bool {
        self.relationships.iter().any(|rel| rel.name == name)
    }
}

/// Entities of one database schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    name: String,
    entities: Vec<Entity>,
}

#[derive(Debug)]
struct ForeignKey {
    child: String,
    parent: String,
    pairs: Vec<(String, String)>,
    nullable: bool,
}

impl Schema {
    /// Builds a schema from known entities.
    pub fn new(name: impl Into<String>, entities: Vec<Entity>) -> Self {
        Self {
            name: name.into(),
            entities,
        }
    }

    /// Reads tables and foreign keys from an SQLite schema.
    #[tracing::instrument(level = "debug", skip(pool), err)]
    pub async fn introspect(pool: &SqlitePool, name: &str) -> Result<Self> {
        let tables: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT name FROM {}.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
            quote(name)
        ))
        .fetch_all(pool)
        .await?;

        let mut keys = Vec::new();
        for table in &tables {
            keys.extend(foreign_keys(pool, name, table).await?);
        }

        let mut entities: Vec<Entity> = tables.iter().map(Entity::new).collect();

        for key in keys {
            let Some(parent) = entities
                .iter()
                .position(|entity| entity.table.eq_ignore_ascii_case(&key.parent))
            else {
                tracing::debug!(child = %key.child, parent = %key.parent, "foreign key to unknown table");
                continue;
            };
            let Some(child) = entities
                .iter()
                .position(|entity| entity.table == key.child)
            else {
                continue;
            };

            let parent_class = entities[parent].class.clone();
            let parent_table = entities[parent].table.clone();
            let child_class = entities[child].class.clone();
            let first_column = key.pairs[0].0.clone();

            let mut name = key.child.clone();
            if entities[parent].relationship_named(&name) {
                name = format!("{name}_{first_column}");
            }
            entities[parent].relationships.push(Relationship {
                name,
                class: child_class,
                cardinality: Cardinality::HasMany,
                join_type: JoinType::LeftOuter,
                columns: key.pairs.clone(),
            });

            let mut name = parent_table;
            if entities[child].relationship_named(&name) {
                name = format!("{name}_{first_column}");
            }
            entities[child].relationships.push(Relationship {
                name,
                class: parent_class,
                cardinality: Cardinality::BelongsTo,
                join_type: if key.nullable {
                    JoinType::LeftOuter
                } else {
                    JoinType::Inner
                },
                columns: key
                    .pairs
                    .iter()
                    .map(|(own, target)| (target.clone(), own.clone()))
                    .collect(),
            });
        }

        Ok(Self::new(name, entities))
    }

    /// The schema name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks an entity up by class name.
    pub fn entity(&self, class: &str) -> Option<&Entity> {
        self.entities.iter().find(|entity| entity.class == class)
    }

    /// Resolves the entity configured for `kind`.
    pub fn entity_for(&self, config: &RealmConfig, kind: EntityKind) -> Result<&Entity> {
        let class = config.resultset(kind);
        self.entity(&class).ok_or_else(|| Error::UnknownEntity {
            kind,
            class,
            schema: self.name.clone(),
        })
    }
}

async fn foreign_keys(pool: &SqlitePool, schema: &str, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = sqlx::query(
        r#"SELECT "id", "table", "from", "to" FROM pragma_foreign_key_list(?, ?) ORDER BY "id", "seq""#,
    )
    .bind(table)
    .bind(schema)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut not_null = BTreeMap::new();
    for row in sqlx::query(r#"SELECT "name", "notnull" FROM pragma_table_info(?, ?)"#)
        .bind(table)
        .bind(schema)
        .fetch_all(pool)
        .await?
    {
        let column: String = row.try_get("name")?;
        let flag: i64 = row.try_get("notnull")?;
        not_null.insert(column, flag != 0);
    }

    let mut grouped: BTreeMap<i64, ForeignKey> = BTreeMap::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let parent: String = row.try_get("table")?;
        let from: String = row.try_get("from")?;
        let to: Option<String> = row.try_get("to")?;

        let key = grouped.entry(id).or_insert_with(|| ForeignKey {
            child: table.to_string(),
            parent: parent.clone(),
            pairs: Vec::new(),
            nullable: false,
        });

        // A key declared without parent columns references the primary key.
        let to = match to {
            Some(to) => to,
            None => primary_key_column(pool, schema, &parent, key.pairs.len()).await?,
        };

        key.nullable |= !not_null.get(&from).copied().unwrap_or(false);
        key.pairs.push((from, to));
    }

    Ok(grouped.into_values().collect())
}

async fn primary_key_column(
    pool: &SqlitePool,
    schema: &str,
    table: &str,
    position: usize,
) -> Result<String> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"SELECT "name" FROM pragma_table_info(?, ?) WHERE "pk" > 0 ORDER BY "pk""#,
    )
    .bind(table)
    .bind(schema)
    .fetch_all(pool)
    .await?;

    // SQLite falls back to the implicit rowid when no primary key is declared.
    Ok(columns
        .into_iter()
        .nth(position)
        .unwrap_or_else(|| "rowid".to_string()))
}

/// One side of the user/role link: a parent table and the join table column
/// referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Has-many relationship from the parent to the join entity.
    pub relationship: String,
    /// Belongs-to accessor from the join entity back to the parent.
    pub reverse: String,
    /// Parent table.
    pub table: String,
    /// Parent column the join table references.
    pub key_column: String,
    /// Join table column referencing the parent.
    pub join_column: String,
}

/// Both sides of the user/role link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBindings {
    /// Join table.
    pub join_table: String,
    /// The users side.
    pub user: Binding,
    /// The roles side.
    pub role: Binding,
}

/// Table names the store works with, resolved once per store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Schema the tables live in.
    pub schema: String,
    /// Users table.
    pub users: String,
    /// Role bindings, absent when roles are disabled.
    pub roles: Option<RoleBindings>,
}

impl Layout {
    /// Resolves the configured entities against the schema and discovers the
    /// role relationships.
    pub fn resolve(schema: &Schema, config: &RealmConfig) -> Result<Self> {
        let users = schema.entity_for(config, EntityKind::User)?.table.clone();
        let roles = discover(schema, config)?;

        Ok(Self {
            schema: schema.name().to_string(),
            users,
            roles,
        })
    }
}

/// Discovers the relationships linking users and roles through the join
/// entity.
///
/// Returns `Ok(None)` when roles are disabled. Otherwise both sides must have
/// exactly one qualifying relationship.
pub fn discover(schema: &Schema, config: &RealmConfig) -> Result<Option<RoleBindings>> {
    if config.disable_roles {
        return Ok(None);
    }

    let join = schema.entity_for(config, EntityKind::UserRole)?;
    let user = bind(schema, config, EntityKind::User, join)?;
    let role = bind(schema, config, EntityKind::Role, join)?;

    tracing::debug!(
        user = %user.relationship,
        role = %role.relationship,
        join = %join.table,
        "discovered role relationships"
    );

    Ok(Some(RoleBindings {
        join_table: join.table.clone(),
        user,
        role,
    }))
}

fn bind(schema: &Schema, config: &RealmConfig, kind: EntityKind, join: &Entity) -> Result<Binding> {
    let entity = schema.entity_for(config, kind)?;
    let wanted = config.relationship_override(kind);

    let candidates: Vec<&Relationship> = entity
        .relationships
        .iter()
        .filter(|rel| qualifies(rel, &join.class))
        .filter(|rel| wanted.map_or(true, |name| rel.name == name))
        .collect();

    let forward = match candidates.as_slice() {
        [forward] => *forward,
        [] => {
            return Err(Error::MissingRelationship {
                entity: entity.class.clone(),
                join: join.class.clone(),
            })
        }
        _ => {
            return Err(Error::AmbiguousRelationship {
                entity: entity.class.clone(),
                join: join.class.clone(),
                candidates: candidates.iter().map(|rel| rel.name.clone()).collect(),
            })
        }
    };

    let (join_column, key_column) = forward.columns[0].clone();

    let reverse = join
        .relationships
        .iter()
        .find(|rel| {
            rel.cardinality == Cardinality::BelongsTo
                && rel.class == entity.class
                && rel.columns == [(key_column.clone(), join_column.clone())]
        })
        .ok_or_else(|| Error::MissingRelationship {
            entity: join.class.clone(),
            join: entity.class.clone(),
        })?;

    Ok(Binding {
        relationship: forward.name.clone(),
        reverse: reverse.name.clone(),
        table: entity.table.clone(),
        key_column,
        join_column,
    })
}

fn qualifies(rel: &Relationship, join_class: &str) -> bool {
    rel.class == join_class
        && rel.cardinality == Cardinality::HasMany
        && rel.join_type == JoinType::LeftOuter
        && rel.columns.len() == 1
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn pool(ddl: &str) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::raw_sql(ddl).execute(&pool).await.unwrap();
        pool
    }

    const CONVENTIONAL: &str = r#"
        CREATE TABLE user (id INTEGER PRIMARY KEY, username TEXT NOT NULL UNIQUE, password TEXT);
        CREATE TABLE role (id INTEGER PRIMARY KEY, role TEXT NOT NULL UNIQUE);
        CREATE TABLE user_roles (
            user_id INTEGER NOT NULL REFERENCES user(id),
            role_id INTEGER NOT NULL REFERENCES role,
            PRIMARY KEY (user_id, role_id)
        );
    "#;

    fn has_many(name: &str, class: &str, columns: &[(&str, &str)]) -> Relationship {
        Relationship {
            name: name.to_string(),
            class: class.to_string(),
            cardinality: Cardinality::HasMany,
            join_type: JoinType::LeftOuter,
            columns: columns
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    fn belongs_to(name: &str, class: &str, columns: &[(&str, &str)]) -> Relationship {
        Relationship {
            cardinality: Cardinality::BelongsTo,
            join_type: JoinType::Inner,
            ..has_many(name, class, columns)
        }
    }

    fn hand_built(user_relationships: Vec<Relationship>) -> Schema {
        let mut user = Entity::new("user");
        user.relationships = user_relationships;

        let mut role = Entity::new("role");
        role.relationships = vec![has_many("user_roles", "UserRoles", &[("role_id", "id")])];

        let mut join = Entity::new("user_roles");
        join.relationships = vec![
            belongs_to("user", "User", &[("id", "user_id")]),
            belongs_to("role", "Role", &[("id", "role_id")]),
        ];

        Schema::new("main", vec![user, role, join])
    }

    #[tokio::test]
    async fn test_introspect() {
        let pool = pool(CONVENTIONAL).await;
        let schema = Schema::introspect(&pool, "main").await.unwrap();

        let user = schema.entity("User").unwrap();
        assert_eq!(user.table, "user");
        assert_eq!(
            user.relationships,
            vec![has_many("user_roles", "UserRoles", &[("user_id", "id")])]
        );

        let join = schema.entity("UserRoles").unwrap();
        assert_eq!(join.relationships.len(), 2);
        assert!(join
            .relationships
            .contains(&belongs_to("role", "Role", &[("id", "role_id")])));
        assert!(join
            .relationships
            .contains(&belongs_to("user", "User", &[("id", "user_id")])));
    }

    #[tokio::test]
    async fn test_nullable_key_is_left_joined() {
        let pool = pool(
            "CREATE TABLE user (id INTEGER PRIMARY KEY);
             CREATE TABLE note (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES user(id));",
        )
        .await;
        let schema = Schema::introspect(&pool, "main").await.unwrap();

        let note = schema.entity("Note").unwrap();
        assert_eq!(note.relationships[0].join_type, JoinType::LeftOuter);
    }

    #[tokio::test]
    async fn test_discover_conventional_layout() {
        let pool = pool(CONVENTIONAL).await;
        let schema = Schema::introspect(&pool, "main").await.unwrap();

        let layout = Layout::resolve(&schema, &RealmConfig::default()).unwrap();
        assert_eq!(layout.users, "user");

        let bindings = layout.roles.unwrap();
        assert_eq!(bindings.join_table, "user_roles");
        assert_eq!(
            bindings.user,
            Binding {
                relationship: "user_roles".to_string(),
                reverse: "user".to_string(),
                table: "user".to_string(),
                key_column: "id".to_string(),
                join_column: "user_id".to_string(),
            }
        );
        assert_eq!(bindings.role.table, "role");
        assert_eq!(bindings.role.reverse, "role");
        assert_eq!(bindings.role.join_column, "role_id");
    }

    #[test]
    fn test_disabled_roles() {
        let config = RealmConfig {
            disable_roles: true,
            ..Default::default()
        };
        assert_eq!(discover(&Schema::default(), &config).unwrap(), None);
    }

    #[test]
    fn test_ambiguous_relationships() {
        let schema = hand_built(vec![
            has_many("user_roles", "UserRoles", &[("user_id", "id")]),
            has_many("granted_roles", "UserRoles", &[("granted_by", "id")]),
        ]);

        let err = discover(&schema, &RealmConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::AmbiguousRelationship { ref entity, ref candidates, .. }
                if entity == "User" && candidates.len() == 2
        ));
    }

    #[test]
    fn test_override_resolves_ambiguity() {
        let schema = hand_built(vec![
            has_many("user_roles", "UserRoles", &[("user_id", "id")]),
            has_many("granted_roles", "UserRoles", &[("granted_by", "id")]),
        ]);
        let config = RealmConfig {
            user_user_roles_relationship: Some("user_roles".to_string()),
            ..Default::default()
        };

        let bindings = discover(&schema, &config).unwrap().unwrap();
        assert_eq!(bindings.user.relationship, "user_roles");
    }

    #[test]
    fn test_unqualified_relationships_are_skipped() {
        let mut multi_column = has_many("user_roles", "UserRoles", &[("user_id", "id"), ("x", "y")]);
        multi_column.name = "composite".to_string();
        let inner = Relationship {
            join_type: JoinType::Inner,
            ..has_many("inner", "UserRoles", &[("user_id", "id")])
        };

        let schema = hand_built(vec![multi_column, inner]);
        let err = discover(&schema, &RealmConfig::default()).unwrap_err();
        assert!(matches!(err, Error::MissingRelationship { ref entity, .. } if entity == "User"));
    }

    #[test]
    fn test_unknown_entity() {
        let config = RealmConfig {
            user_roles_resultset: Some("Memberships".to_string()),
            ..Default::default()
        };
        let err = discover(&hand_built(vec![]), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownEntity { kind: EntityKind::UserRole, ref class, .. } if class == "Memberships"
        ));
    }
}
