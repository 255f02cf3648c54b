use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde_json::json;

use komento_api::{
    Backend, ChangeFeed, ChannelTopic, CommentId, CounterTarget, EntityRef, EntityType, Error,
    FeedReceiver, Like, NewComment, NewNotification, RawComment, RawUser, UserId, Uuid,
};

const USERS_TABLE: &str = "profiles";
const NOTIFICATIONS_TABLE: &str = "notifications";
const COMMENTS_RPC: &str = "get_comments_with_users";
const COUNTER_RPC: &str = "increment_counter";

/// Retries of idempotent reads on transient failures
const READ_RETRIES: u32 = 3;

/// `Backend` talking to a PostgREST endpoint.
///
/// Reads are retried on transient failures, writes are sent exactly once and
/// left to the engine's rollback.
pub struct RestBackend {
    base: String,
    api_key: String,
    token: String,
    reads: ClientWithMiddleware,
    writes: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct LikeRow {
    comment_id: CommentId,
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::TransientNetwork(e.to_string())
    } else {
        Error::Unknown(e.to_string())
    }
}

fn middleware_error(e: reqwest_middleware::Error) -> Error {
    match e {
        reqwest_middleware::Error::Reqwest(e) => transport_error(e),
        reqwest_middleware::Error::Middleware(e) => Error::Unknown(format!("{e:#}")),
    }
}

fn uuid_list<'a>(ids: impl Iterator<Item = &'a Uuid>) -> String {
    let ids = ids.map(|i| i.to_string()).collect::<Vec<_>>();
    format!("in.({})", ids.join(","))
}

fn quoted_list(names: &[String]) -> String {
    let names = names
        .iter()
        .map(|n| format!("\"{}\"", n.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>();
    format!("in.({})", names.join(","))
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, rpc: bool) -> Result<T, Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.bytes().await.map_err(transport_error)?;
        return Err(Error::from_status(status, rpc, &body));
    }
    resp.json()
        .await
        .map_err(|e| Error::Unknown(format!("parsing backend response: {e}")))
}

async fn check(resp: reqwest::Response) -> Result<(), Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.bytes().await.map_err(transport_error)?;
        return Err(Error::from_status(status, false, &body));
    }
    Ok(())
}

impl RestBackend {
    pub fn new(base: &str, api_key: String, token: Option<String>) -> RestBackend {
        let retry = ExponentialBackoff::builder().build_with_max_retries(READ_RETRIES);
        let reads = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry))
            .build();
        RestBackend {
            base: String::from(base.trim_end_matches('/')),
            token: token.unwrap_or_else(|| api_key.clone()),
            api_key,
            reads,
            writes: reqwest::Client::new(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base)
    }

    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{name}", self.base)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, Error> {
        tracing::trace!(table, ?query, "select");
        let resp = self
            .reads
            .get(self.table_url(table))
            .query(query)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(middleware_error)?;
        decode(resp, false).await
    }

    fn write(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.writes
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.token)
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn rpc_comments_with_users(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error> {
        // the procedure only reads, so it goes through the retrying client
        let resp = self
            .reads
            .post(self.rpc_url(COMMENTS_RPC))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.token)
            .json(&json!({
                "p_entity_type": entity.entity_type.as_str(),
                "p_entity_id": entity.entity_id.0,
            }))
            .send()
            .await
            .map_err(middleware_error)?;
        decode(resp, true).await
    }

    async fn select_comments(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error> {
        let t = entity.entity_type;
        self.select(
            t.comment_table(),
            &[
                (t.parent_column(), format!("eq.{}", entity.entity_id)),
                ("order", String::from("created_at.asc")),
            ],
        )
        .await
    }

    async fn select_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
    ) -> Result<Option<RawComment>, Error> {
        let rows: Vec<RawComment> = self
            .select(entity_type.comment_table(), &[("id", format!("eq.{id}"))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<RawUser>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(USERS_TABLE, &[("id", uuid_list(ids.iter().map(|u| &u.0)))])
            .await
    }

    async fn select_users_by_name(&self, usernames: &[String]) -> Result<Vec<RawUser>, Error> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        self.select(USERS_TABLE, &[("username", quoted_list(usernames))])
            .await
    }

    async fn select_liked(
        &self,
        entity_type: EntityType,
        user: UserId,
        comments: &[CommentId],
    ) -> Result<Vec<CommentId>, Error> {
        if comments.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<LikeRow> = self
            .select(
                entity_type.like_table(),
                &[
                    ("select", String::from("comment_id")),
                    ("user_id", format!("eq.{user}")),
                    ("comment_id", uuid_list(comments.iter().map(|c| &c.0))),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.comment_id).collect())
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, Error> {
        let rows: Vec<serde_json::Value> = self
            .select(
                entity.entity_type.entity_table(),
                &[
                    ("select", String::from("id")),
                    ("id", format!("eq.{}", entity.entity_id)),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn insert_comment(&self, c: NewComment) -> Result<RawComment, Error> {
        let t = c.entity.entity_type;
        let mut row = json!({
            "id": c.id.0,
            "user_id": c.author_id.0,
            "parent_comment_id": c.parent_id.map(|p| p.0),
            "content": c.content,
            "mentions": c.mentions,
            "created_at": c.created_at,
        });
        row[t.parent_column()] = json!(c.entity.entity_id.0);
        let resp = self
            .write(reqwest::Method::POST, self.table_url(t.comment_table()))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(transport_error)?;
        let rows: Vec<RawComment> = decode(resp, false).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::Unknown(format!("insert of comment {} returned no row", c.id)))
    }

    async fn delete_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
        author: UserId,
    ) -> Result<u64, Error> {
        let resp = self
            .write(
                reqwest::Method::DELETE,
                self.table_url(entity_type.comment_table()),
            )
            .query(&[
                ("id", format!("eq.{id}")),
                ("user_id", format!("eq.{author}")),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(transport_error)?;
        let rows: Vec<serde_json::Value> = decode(resp, false).await?;
        Ok(rows.len() as u64)
    }

    async fn like_exists(&self, entity_type: EntityType, like: Like) -> Result<bool, Error> {
        let rows: Vec<LikeRow> = self
            .select(
                entity_type.like_table(),
                &[
                    ("select", String::from("comment_id")),
                    ("user_id", format!("eq.{}", like.user_id)),
                    ("comment_id", format!("eq.{}", like.comment_id)),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn insert_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error> {
        let resp = self
            .write(
                reqwest::Method::POST,
                self.table_url(entity_type.like_table()),
            )
            .header("Prefer", "resolution=ignore-duplicates")
            .json(&json!({
                "comment_id": like.comment_id.0,
                "user_id": like.user_id.0,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        check(resp).await
    }

    async fn delete_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error> {
        let resp = self
            .write(
                reqwest::Method::DELETE,
                self.table_url(entity_type.like_table()),
            )
            .query(&[
                ("comment_id", format!("eq.{}", like.comment_id)),
                ("user_id", format!("eq.{}", like.user_id)),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        check(resp).await
    }

    async fn rpc_increment_counter(
        &self,
        target: CounterTarget,
        delta: i64,
    ) -> Result<i64, Error> {
        let resp = self
            .write(reqwest::Method::POST, self.rpc_url(COUNTER_RPC))
            .json(&json!({
                "p_table": target.entity_type.comment_table(),
                "p_comment_id": target.comment_id.0,
                "p_column": target.counter.column(),
                "p_delta": delta,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp, true).await
    }

    async fn read_counter(&self, target: CounterTarget) -> Result<i64, Error> {
        let column = target.counter.column();
        let rows: Vec<serde_json::Value> = self
            .select(
                target.entity_type.comment_table(),
                &[
                    ("select", String::from(column)),
                    ("id", format!("eq.{}", target.comment_id)),
                ],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::EntityNotFound(format!("comment {}", target.comment_id)))?;
        Ok(row.get(column).and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn write_counter(&self, target: CounterTarget, value: i64) -> Result<(), Error> {
        let mut patch = json!({});
        patch[target.counter.column()] = json!(value);
        let resp = self
            .write(
                reqwest::Method::PATCH,
                self.table_url(target.entity_type.comment_table()),
            )
            .query(&[("id", format!("eq.{}", target.comment_id))])
            .json(&patch)
            .send()
            .await
            .map_err(transport_error)?;
        check(resp).await
    }

    async fn insert_notification(&self, n: NewNotification) -> Result<(), Error> {
        let resp = self
            .write(reqwest::Method::POST, self.table_url(NOTIFICATIONS_TABLE))
            .json(&json!({
                "user_id": n.recipient.0,
                "actor_id": n.actor.0,
                "type": n.kind,
                "entity_type": n.entity.entity_type.as_str(),
                "entity_id": n.entity.entity_id.0,
                "comment_id": n.comment_id.0,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        check(resp).await
    }
}

/// Change feed of a deployment without realtime channels: every channel
/// fails to open, which keeps the engine on polling
pub struct NoChangeFeed;

#[async_trait]
impl ChangeFeed for NoChangeFeed {
    async fn open_channel(&self, topic: ChannelTopic) -> Result<FeedReceiver, Error> {
        Err(Error::Unavailable(format!(
            "realtime channel for {}?{}",
            topic.table, topic.filter
        )))
    }
}
