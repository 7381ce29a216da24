//! Bitable tables and records.

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{LarkError, Result};
use crate::lark::client::LarkClient;

pub const RECORDS_PAGE_SIZE: u32 = 500;
pub const TABLES_PAGE_SIZE: u32 = 100;

/// One Bitable row. Field values are kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub record_id: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_id: String,
    #[serde(default)]
    pub name: String,
}

/// One list response. `T` is the item type.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub page_token: Option<String>,
}

impl<T> Page<T> {
    fn from_body(body: &serde_json::Value, context: &str) -> Result<Self>
    where
        T: serde::de::DeserializeOwned,
    {
        match body.get("data") {
            // Lark sends `items: null` for an empty table.
            Some(data) if !data.is_null() => {
                let mut data = data.clone();
                if data.get("items").is_some_and(serde_json::Value::is_null) {
                    data["items"] = serde_json::Value::Array(Vec::new());
                }
                serde_json::from_value(data).map_err(|e| LarkError::unexpected(context, e.to_string()))
            }
            _ => Ok(Self {
                items: Vec::new(),
                has_more: false,
                page_token: None,
            }),
        }
    }
}

/// Drain a cursor-paginated endpoint.
///
/// `fetch_page` gets the cursor for the next request (`None` for the first).
/// Stops when `has_more` is false or no cursor is supplied; a cursor seen
/// earlier in the same drain is a protocol fault.
pub async fn drain_pages<T, F, Fut>(resource: &str, mut fetch_page: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();
    let mut pages = 0usize;

    loop {
        let page = fetch_page(cursor.clone()).await?;
        pages += 1;
        tracing::debug!(
            resource,
            page = pages,
            items = page.items.len(),
            has_more = page.has_more,
            "fetched page"
        );
        items.extend(page.items);

        if !page.has_more {
            break;
        }
        let next = match page.page_token.filter(|t| !t.is_empty()) {
            Some(next) => next,
            None => {
                tracing::warn!(resource, "has_more=true without page_token; stopping");
                break;
            }
        };
        if !seen.insert(next.clone()) {
            return Err(LarkError::PaginationStalled {
                resource: resource.to_string(),
                cursor: next,
            });
        }
        cursor = Some(next);
    }

    Ok(items)
}

/// All tables of one app with their records, keyed by table name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub data: BTreeMap<String, TableRecords>,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableRecords {
    pub table_id: String,
    pub records: Vec<Record>,
}

/// Bitable operations scoped to one app.
#[derive(Clone)]
pub struct BitableClient {
    client: LarkClient,
    app_token: String,
    page_size: u32,
}

impl BitableClient {
    pub fn new(client: LarkClient, app_token: impl Into<String>) -> Self {
        Self {
            client,
            app_token: app_token.into(),
            page_size: RECORDS_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, RECORDS_PAGE_SIZE);
        self
    }

    pub fn app_token(&self) -> &str {
        &self.app_token
    }

    fn app_path(&self) -> String {
        format!(
            "/bitable/v1/apps/{}",
            urlencoding::encode(&self.app_token)
        )
    }

    fn records_path(&self, table_id: &str) -> String {
        format!(
            "{}/tables/{}/records",
            self.app_path(),
            urlencoding::encode(table_id)
        )
    }

    async fn page<T>(
        &self,
        context: &str,
        path: &str,
        page_size: u32,
        cursor: Option<String>,
    ) -> Result<Page<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut query = vec![("page_size", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("page_token", cursor));
        }
        let body = self.client.get_json(context, path, &query).await?;
        Page::from_body(&body, context)
    }

    /// Every record of a table, in page arrival order.
    pub async fn fetch_all(&self, table_id: &str) -> Result<Vec<Record>> {
        let path = self.records_path(table_id);
        let records = drain_pages(table_id, |cursor| {
            self.page::<Record>("list records", &path, self.page_size, cursor)
        })
        .await?;
        tracing::info!(table_id, count = records.len(), "fetched records");
        Ok(records)
    }

    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let path = format!("{}/tables", self.app_path());
        drain_pages(&self.app_token, |cursor| {
            self.page::<TableInfo>("list tables", &path, TABLES_PAGE_SIZE, cursor)
        })
        .await
    }

    /// All tables, their records fetched concurrently.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let tables = self.list_tables().await?;
        let all = try_join_all(tables.iter().map(|t| self.fetch_all(&t.table_id))).await?;

        let mut snapshot = Snapshot {
            data: BTreeMap::new(),
            tables: tables.clone(),
        };
        for (table, records) in tables.into_iter().zip(all) {
            snapshot.data.insert(
                table.name,
                TableRecords {
                    table_id: table.table_id,
                    records,
                },
            );
        }
        Ok(snapshot)
    }

    pub async fn create_record(
        &self,
        table_id: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Record> {
        let body = serde_json::json!({ "fields": fields });
        let resp = self
            .client
            .post_json("create record", &self.records_path(table_id), &body)
            .await?;
        record_from(&resp, "create record")
    }

    pub async fn update_record(
        &self,
        table_id: &str,
        record_id: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Record> {
        let path = format!(
            "{}/{}",
            self.records_path(table_id),
            urlencoding::encode(record_id)
        );
        let body = serde_json::json!({ "fields": fields });
        let resp = self.client.put_json("update record", &path, &body).await?;
        record_from(&resp, "update record")
    }
}

fn record_from(body: &serde_json::Value, context: &str) -> Result<Record> {
    let record = body
        .pointer("/data/record")
        .ok_or_else(|| LarkError::unexpected(context, "missing data.record"))?;
    serde_json::from_value(record.clone()).map_err(|e| LarkError::unexpected(context, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::client::test_support::client_for;
    use wiremock::matchers::{body_json, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn items(range: std::ops::Range<usize>) -> Vec<serde_json::Value> {
        range
            .map(|i| serde_json::json!({ "record_id": format!("rec{i}"), "fields": { "n": i } }))
            .collect()
    }

    fn page_body(items: Vec<serde_json::Value>, has_more: bool, token: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "code": 0,
            "msg": "success",
            "data": { "items": items, "has_more": has_more, "page_token": token }
        })
    }

    const RECORDS: &str = "/bitable/v1/apps/bascnAPP/tables/tblTasks/records";

    #[tokio::test]
    async fn fetch_all_drains_three_pages_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .and(query_param("page_size", "500"))
            .and(query_param_is_missing("page_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(items(0..500), true, Some("p2"))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .and(query_param("page_token", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(items(500..1000), true, Some("p3"))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .and(query_param("page_token", "p3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(items(1000..1037), false, None)))
            .expect(1)
            .mount(&server)
            .await;

        let bitable = BitableClient::new(client_for(&server.uri()), "bascnAPP");
        let records = bitable.fetch_all("tblTasks").await.unwrap();

        assert_eq!(records.len(), 1037);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.record_id, format!("rec{i}"));
        }
    }

    #[tokio::test]
    async fn fetch_all_surfaces_upstream_error_and_discards_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .and(query_param_is_missing("page_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(items(0..3), true, Some("p2"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .and(query_param("page_token", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 1254290,
                "msg": "TooManyRequest"
            })))
            .mount(&server)
            .await;

        let bitable = BitableClient::new(client_for(&server.uri()), "bascnAPP");
        let err = bitable.fetch_all("tblTasks").await.unwrap_err();
        assert_eq!(err.upstream_message(), Some("TooManyRequest"));
    }

    #[tokio::test]
    async fn empty_page_with_has_more_keeps_looping() {
        let mut calls = 0;
        let result = drain_pages("tbl", |cursor| {
            calls += 1;
            let page = match cursor.as_deref() {
                None => Page { items: vec![], has_more: true, page_token: Some("a".into()) },
                Some("a") => Page { items: vec![1, 2], has_more: false, page_token: None },
                other => panic!("unexpected cursor {other:?}"),
            };
            async move { Ok::<_, LarkError>(page) }
        })
        .await
        .unwrap();
        assert_eq!(result, vec![1, 2]);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn repeated_cursor_is_a_protocol_fault() {
        let result = drain_pages("tbl", |_cursor| async {
            Ok::<_, LarkError>(Page {
                items: vec![0u8],
                has_more: true,
                page_token: Some("same".into()),
            })
        })
        .await;
        assert!(matches!(
            result,
            Err(LarkError::PaginationStalled { ref cursor, .. }) if cursor == "same"
        ));
    }

    #[tokio::test]
    async fn cursor_cycle_is_a_protocol_fault() {
        let mut calls = 0;
        let result = drain_pages("tbl", |cursor| {
            calls += 1;
            let next = match cursor.as_deref() {
                None | Some("b") => "a",
                _ => "b",
            };
            async move {
                Ok::<_, LarkError>(Page {
                    items: vec![0u8],
                    has_more: true,
                    page_token: Some(next.into()),
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(LarkError::PaginationStalled { ref cursor, .. }) if cursor == "a"
        ));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn has_more_without_cursor_stops() {
        let result = drain_pages("tbl", |_cursor| async {
            Ok::<_, LarkError>(Page {
                items: vec!["x"],
                has_more: true,
                page_token: None,
            })
        })
        .await
        .unwrap();
        assert_eq!(result, vec!["x"]);
    }

    #[test]
    fn null_items_parse_as_empty() {
        let body = serde_json::json!({
            "code": 0,
            "data": { "items": null, "has_more": false, "total": 0 }
        });
        let page: Page<Record> = Page::from_body(&body, "list records").unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn snapshot_keys_records_by_table_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bitable/v1/apps/bascnAPP/tables"))
            .and(query_param("page_size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                vec![
                    serde_json::json!({ "table_id": "tblA", "name": "Tasks" }),
                    serde_json::json!({ "table_id": "tblB", "name": "Members" }),
                ],
                false,
                None,
            )))
            .mount(&server)
            .await;
        for (table, count) in [("tblA", 2usize), ("tblB", 1usize)] {
            Mock::given(method("GET"))
                .and(path(format!("/bitable/v1/apps/bascnAPP/tables/{table}/records")))
                .respond_with(ResponseTemplate::new(200).set_body_json(page_body(items(0..count), false, None)))
                .mount(&server)
                .await;
        }

        let bitable = BitableClient::new(client_for(&server.uri()), "bascnAPP");
        let snapshot = bitable.snapshot().await.unwrap();
        assert_eq!(snapshot.tables.len(), 2);
        assert_eq!(snapshot.data["Tasks"].table_id, "tblA");
        assert_eq!(snapshot.data["Tasks"].records.len(), 2);
        assert_eq!(snapshot.data["Members"].records.len(), 1);
    }

    #[tokio::test]
    async fn update_record_puts_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("{RECORDS}/recX")))
            .and(body_json(serde_json::json!({ "fields": { "状态": "进行中" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "record": { "record_id": "recX", "fields": { "状态": "进行中" } } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let bitable = BitableClient::new(client_for(&server.uri()), "bascnAPP");
        let mut fields = serde_json::Map::new();
        fields.insert("状态".into(), serde_json::json!("进行中"));
        let record = bitable.update_record("tblTasks", "recX", fields).await.unwrap();
        assert_eq!(record.record_id, "recX");
    }
}
