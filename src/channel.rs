#![forbid(unsafe_code)]

//! Feed-level configuration: a single `channel` row that drives the podcast
//! output. Created on first PUT, updated in place afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, Value, params};
use serde::{Deserialize, Serialize};

/// Well-known primary key. Using a fixed id guarantees at most one row
/// without relying on `LIMIT 1` conventions.
const CHANNEL_ROW_ID: &str = "channel";

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    pub explicit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incoming channel settings. Optional fields left out of an update keep
/// their stored values; `name` and `description` are always required.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelUpdate {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub explicit: Option<bool>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub authors_email: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channel (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            website_url TEXT,
            explicit INTEGER NOT NULL DEFAULT 0,
            image_url TEXT,
            copyright TEXT,
            language TEXT NOT NULL DEFAULT 'en',
            feed_url TEXT,
            category TEXT,
            authors TEXT,
            authors_email TEXT,
            owner TEXT,
            owner_email TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .await?;
    Ok(())
}

const CHANNEL_COLUMNS: &str = r#"
    id, name, description, website_url, explicit, image_url, copyright,
    language, feed_url, category, authors, authors_email, owner, owner_email,
    created_at, updated_at
"#;

/// Reader/writer for the singleton channel row.
#[derive(Clone)]
pub struct ChannelStore {
    conn: Connection,
}

impl ChannelStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening channel DB {}", path.display()))?;
        let conn = db.connect()?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn get(&self) -> Result<Option<Channel>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channel WHERE id = ?1"
            ))
            .await?;
        let mut rows = stmt.query([CHANNEL_ROW_ID]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    /// Inserts the row on first write, otherwise updates the supplied fields
    /// in place. `updated_at` is bumped either way; `created_at` is set once.
    pub async fn upsert(&self, update: &ChannelUpdate) -> Result<Channel> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        if self.get().await?.is_none() {
            self.conn
                .execute(
                    r#"
                    INSERT INTO channel (
                        id, name, description, website_url, explicit, image_url,
                        copyright, language, feed_url, category, authors,
                        authors_email, owner, owner_email, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                    "#,
                    params![
                        CHANNEL_ROW_ID,
                        update.name.as_str(),
                        update.description.as_str(),
                        update.website_url.as_deref(),
                        update.explicit.unwrap_or(false) as i64,
                        update.image_url.as_deref(),
                        update.copyright.as_deref(),
                        update.language.as_deref().unwrap_or("en"),
                        update.feed_url.as_deref(),
                        update.category.as_deref(),
                        update.authors.as_deref(),
                        update.authors_email.as_deref(),
                        update.owner.as_deref(),
                        update.owner_email.as_deref(),
                        now.as_str(),
                    ],
                )
                .await
                .context("inserting channel row")?;
        } else {
            // Only the supplied optional fields are rewritten.
            let mut assignments = vec![
                "name = ?".to_string(),
                "description = ?".to_string(),
                "updated_at = ?".to_string(),
            ];
            let mut values: Vec<Value> = vec![
                Value::from(update.name.as_str()),
                Value::from(update.description.as_str()),
                Value::from(now.as_str()),
            ];

            let optional_text = [
                ("website_url", &update.website_url),
                ("image_url", &update.image_url),
                ("copyright", &update.copyright),
                ("language", &update.language),
                ("feed_url", &update.feed_url),
                ("category", &update.category),
                ("authors", &update.authors),
                ("authors_email", &update.authors_email),
                ("owner", &update.owner),
                ("owner_email", &update.owner_email),
            ];
            for (column, value) in optional_text {
                if let Some(value) = value {
                    assignments.push(format!("{column} = ?"));
                    values.push(Value::from(value.as_str()));
                }
            }
            if let Some(explicit) = update.explicit {
                assignments.push("explicit = ?".into());
                values.push(Value::from(explicit as i64));
            }
            values.push(Value::from(CHANNEL_ROW_ID));

            self.conn
                .execute(
                    &format!("UPDATE channel SET {} WHERE id = ?", assignments.join(", ")),
                    values,
                )
                .await
                .context("updating channel row")?;
        }

        self.get()
            .await?
            .context("channel row missing right after upsert")
    }
}

fn row_to_channel(row: &Row) -> Result<Channel> {
    fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .with_context(|| format!("parsing stored timestamp {raw:?}"))
    }

    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        website_url: row.get(3)?,
        explicit: row.get::<i64>(4).map(|value| value != 0)?,
        image_url: row.get(5)?,
        copyright: row.get(6)?,
        language: row.get(7)?,
        feed_url: row.get(8)?,
        category: row.get(9)?,
        authors: row.get(10)?,
        authors_email: row.get(11)?,
        owner: row.get(12)?,
        owner_email: row.get(13)?,
        created_at: parse_timestamp(row.get(14)?)?,
        updated_at: parse_timestamp(row.get(15)?)?,
    })
}
