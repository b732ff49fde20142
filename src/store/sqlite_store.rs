use super::schema::*;
use super::{ChatRecord, ContactRecord, DataStore, LabelRecord, MessageRecord, MessageUpdateRecord};
use crate::auth::AuthState;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

// Embed migrations into the binary
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type SqlitePooled = PooledConnection<ConnectionManager<SqliteConnection>>;

fn db_err(e: diesel::result::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn encode_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Relational data store. One pool per process; rows are scoped by
/// `instance_id`, so many instances share the same database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }

        Ok(Self { pool })
    }

    fn get_connection(&self) -> StoreResult<SqlitePooled> {
        self.pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    pub async fn save_auth_state(&self, instance_key: &str, state: &AuthState) -> StoreResult<()> {
        let data = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.get_connection()?;
        diesel::insert_into(auth_states::table)
            .values((
                auth_states::instance_key.eq(instance_key),
                auth_states::state_data.eq(&data),
            ))
            .on_conflict(auth_states::instance_key)
            .do_update()
            .set(auth_states::state_data.eq(&data))
            .execute(&mut conn)
            .map_err(db_err)?;

        Ok(())
    }

    pub async fn load_auth_state(&self, instance_key: &str) -> StoreResult<Option<AuthState>> {
        let mut conn = self.get_connection()?;

        let result: Option<Vec<u8>> = auth_states::table
            .select(auth_states::state_data)
            .filter(auth_states::instance_key.eq(instance_key))
            .first(&mut conn)
            .optional()
            .map_err(db_err)?;

        match result {
            Some(data) => {
                let (state, _) =
                    bincode::serde::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_auth_state(&self, instance_key: &str) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::delete(auth_states::table.filter(auth_states::instance_key.eq(instance_key)))
            .execute(&mut conn)
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn chat_jids(&self, instance_id: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.get_connection()?;
        chats::table
            .filter(chats::instance_id.eq(instance_id))
            .select(chats::remote_jid)
            .load(&mut conn)
            .map_err(db_err)
    }

    async fn insert_chats(&self, instance_id: &str, rows: &[ChatRecord]) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection()?;
        let mut inserted = 0;
        for chat in rows {
            let labels = encode_json(&chat.labels)?;
            inserted += diesel::insert_into(chats::table)
                .values((
                    chats::instance_id.eq(instance_id),
                    chats::remote_jid.eq(&chat.remote_jid),
                    chats::last_msg_timestamp.eq(chat.last_msg_timestamp),
                    chats::labels.eq(labels),
                ))
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .map_err(db_err)?;
        }
        Ok(inserted)
    }

    async fn update_chat_last_message(
        &self,
        instance_id: &str,
        remote_jid: &str,
        timestamp: i64,
    ) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::update(
            chats::table
                .filter(chats::instance_id.eq(instance_id))
                .filter(chats::remote_jid.eq(remote_jid)),
        )
        .set(chats::last_msg_timestamp.eq(Some(timestamp)))
        .execute(&mut conn)
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_chat(&self, instance_id: &str, remote_jid: &str) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::delete(
            chats::table
                .filter(chats::instance_id.eq(instance_id))
                .filter(chats::remote_jid.eq(remote_jid)),
        )
        .execute(&mut conn)
        .map_err(db_err)?;
        Ok(())
    }

    async fn chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<Vec<String>>> {
        let mut conn = self.get_connection()?;
        let raw: Option<String> = chats::table
            .filter(chats::instance_id.eq(instance_id))
            .filter(chats::remote_jid.eq(remote_jid))
            .select(chats::labels)
            .first(&mut conn)
            .optional()
            .map_err(db_err)?;

        match raw {
            Some(raw) => Ok(Some(decode_json(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
        labels: &[String],
    ) -> StoreResult<()> {
        let encoded = encode_json(&labels)?;
        let mut conn = self.get_connection()?;
        diesel::update(
            chats::table
                .filter(chats::instance_id.eq(instance_id))
                .filter(chats::remote_jid.eq(remote_jid)),
        )
        .set(chats::labels.eq(encoded))
        .execute(&mut conn)
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_contact(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<ContactRecord>> {
        let mut conn = self.get_connection()?;
        let row: Option<(String, Option<String>, Option<String>)> = contacts::table
            .filter(contacts::instance_id.eq(instance_id))
            .filter(contacts::remote_jid.eq(remote_jid))
            .select((
                contacts::remote_jid,
                contacts::push_name,
                contacts::profile_pic_url,
            ))
            .first(&mut conn)
            .optional()
            .map_err(db_err)?;

        Ok(row.map(|(remote_jid, push_name, profile_pic_url)| ContactRecord {
            remote_jid,
            push_name,
            profile_pic_url,
        }))
    }

    async fn insert_contacts(
        &self,
        instance_id: &str,
        rows: &[ContactRecord],
    ) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection()?;
        let mut inserted = 0;
        for contact in rows {
            inserted += diesel::insert_into(contacts::table)
                .values((
                    contacts::instance_id.eq(instance_id),
                    contacts::remote_jid.eq(&contact.remote_jid),
                    contacts::push_name.eq(contact.push_name.as_deref()),
                    contacts::profile_pic_url.eq(contact.profile_pic_url.as_deref()),
                ))
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .map_err(db_err)?;
        }
        Ok(inserted)
    }

    async fn upsert_contact(&self, instance_id: &str, contact: &ContactRecord) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(contacts::table)
            .values((
                contacts::instance_id.eq(instance_id),
                contacts::remote_jid.eq(&contact.remote_jid),
                contacts::push_name.eq(contact.push_name.as_deref()),
                contacts::profile_pic_url.eq(contact.profile_pic_url.as_deref()),
            ))
            .on_conflict((contacts::instance_id, contacts::remote_jid))
            .do_update()
            .set((
                contacts::push_name.eq(contact.push_name.as_deref()),
                contacts::profile_pic_url.eq(contact.profile_pic_url.as_deref()),
            ))
            .execute(&mut conn)
            .map_err(db_err)?;
        Ok(())
    }

    async fn message_ids(&self, instance_id: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.get_connection()?;
        messages::table
            .filter(messages::instance_id.eq(instance_id))
            .select(messages::key_id)
            .load(&mut conn)
            .map_err(db_err)
    }

    async fn find_message(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        let mut conn = self.get_connection()?;
        type MessageRow = (
            String,
            String,
            bool,
            Option<String>,
            Option<String>,
            String,
            String,
            i64,
            Option<String>,
            Option<String>,
        );
        let row: Option<MessageRow> = messages::table
            .filter(messages::instance_id.eq(instance_id))
            .filter(messages::key_id.eq(key_id))
            .select((
                messages::key_id,
                messages::remote_jid,
                messages::from_me,
                messages::participant,
                messages::push_name,
                messages::content,
                messages::message_type,
                messages::message_timestamp,
                messages::status,
                messages::source,
            ))
            .first(&mut conn)
            .optional()
            .map_err(db_err)?;

        match row {
            Some((
                key_id,
                remote_jid,
                from_me,
                participant,
                push_name,
                content,
                message_type,
                message_timestamp,
                status,
                source,
            )) => Ok(Some(MessageRecord {
                key_id,
                remote_jid,
                from_me,
                participant,
                push_name,
                content: decode_json(&content)?,
                message_type,
                message_timestamp,
                status,
                source,
            })),
            None => Ok(None),
        }
    }

    async fn insert_messages(
        &self,
        instance_id: &str,
        rows: &[MessageRecord],
    ) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection()?;
        let mut inserted = 0;
        for message in rows {
            let content = encode_json(&message.content)?;
            inserted += diesel::insert_into(messages::table)
                .values((
                    messages::instance_id.eq(instance_id),
                    messages::key_id.eq(&message.key_id),
                    messages::remote_jid.eq(&message.remote_jid),
                    messages::from_me.eq(message.from_me),
                    messages::participant.eq(message.participant.as_deref()),
                    messages::push_name.eq(message.push_name.as_deref()),
                    messages::content.eq(content),
                    messages::message_type.eq(&message.message_type),
                    messages::message_timestamp.eq(message.message_timestamp),
                    messages::status.eq(message.status.as_deref()),
                    messages::source.eq(message.source.as_deref()),
                ))
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .map_err(db_err)?;
        }
        Ok(inserted)
    }

    async fn append_message_update(
        &self,
        instance_id: &str,
        update: &MessageUpdateRecord,
    ) -> StoreResult<()> {
        let poll_updates = match &update.poll_updates {
            Some(value) => Some(encode_json(value)?),
            None => None,
        };
        let mut conn = self.get_connection()?;
        diesel::insert_into(message_updates::table)
            .values((
                message_updates::instance_id.eq(instance_id),
                message_updates::key_id.eq(&update.key_id),
                message_updates::remote_jid.eq(&update.remote_jid),
                message_updates::from_me.eq(update.from_me),
                message_updates::participant.eq(update.participant.as_deref()),
                message_updates::status.eq(&update.status),
                message_updates::date_time.eq(update.date_time),
                message_updates::poll_updates.eq(poll_updates),
            ))
            .execute(&mut conn)
            .map_err(db_err)?;
        Ok(())
    }

    async fn message_updates(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Vec<MessageUpdateRecord>> {
        let mut conn = self.get_connection()?;
        type UpdateRow = (
            String,
            String,
            bool,
            Option<String>,
            String,
            i64,
            Option<String>,
        );
        let rows: Vec<UpdateRow> = message_updates::table
            .filter(message_updates::instance_id.eq(instance_id))
            .filter(message_updates::key_id.eq(key_id))
            .order(message_updates::id.asc())
            .select((
                message_updates::key_id,
                message_updates::remote_jid,
                message_updates::from_me,
                message_updates::participant,
                message_updates::status,
                message_updates::date_time,
                message_updates::poll_updates,
            ))
            .load(&mut conn)
            .map_err(db_err)?;

        rows.into_iter()
            .map(
                |(key_id, remote_jid, from_me, participant, status, date_time, poll_updates)| {
                    Ok(MessageUpdateRecord {
                        key_id,
                        remote_jid,
                        from_me,
                        participant,
                        status,
                        date_time,
                        poll_updates: match poll_updates {
                            Some(raw) => Some(decode_json(&raw)?),
                            None => None,
                        },
                    })
                },
            )
            .collect()
    }

    async fn find_label(
        &self,
        instance_id: &str,
        label_id: &str,
    ) -> StoreResult<Option<LabelRecord>> {
        let mut conn = self.get_connection()?;
        let row: Option<(String, String, String, Option<String>)> = labels::table
            .filter(labels::instance_id.eq(instance_id))
            .filter(labels::label_id.eq(label_id))
            .select((
                labels::label_id,
                labels::name,
                labels::color,
                labels::predefined_id,
            ))
            .first(&mut conn)
            .optional()
            .map_err(db_err)?;

        Ok(
            row.map(|(label_id, name, color, predefined_id)| LabelRecord {
                label_id,
                name,
                color,
                predefined_id,
            }),
        )
    }

    async fn upsert_label(&self, instance_id: &str, label: &LabelRecord) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(labels::table)
            .values((
                labels::instance_id.eq(instance_id),
                labels::label_id.eq(&label.label_id),
                labels::name.eq(&label.name),
                labels::color.eq(&label.color),
                labels::predefined_id.eq(label.predefined_id.as_deref()),
            ))
            .on_conflict((labels::instance_id, labels::label_id))
            .do_update()
            .set((
                labels::name.eq(&label.name),
                labels::color.eq(&label.color),
                labels::predefined_id.eq(label.predefined_id.as_deref()),
            ))
            .execute(&mut conn)
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_label(&self, instance_id: &str, label_id: &str) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        diesel::delete(
            labels::table
                .filter(labels::instance_id.eq(instance_id))
                .filter(labels::label_id.eq(label_id)),
        )
        .execute(&mut conn)
        .map_err(db_err)?;
        Ok(())
    }
}
