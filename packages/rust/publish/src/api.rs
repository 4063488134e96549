//! Remote-API sink.
//!
//! Protocol, all JSON over POST with a bearer token:
//! - `{base}/check` `{id, name}` → `{exists, id, units: [name]}`
//! - `{base}/create` `{id, name, author, cover, description}` → `{id}`
//! - `{base}/add-unit` `{id, unitName, ordinal, assets}` → any 2xx

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use storysync_shared::{EntityRecord, Result, Secret, Snapshot, StorySyncError, normalize_name};

use crate::{Sink, SinkReport};

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    exists: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    units: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    id: &'a str,
    name: &'a str,
    author: &'a str,
    cover: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddUnitRequest<'a> {
    id: &'a str,
    unit_name: &'a str,
    ordinal: u32,
    assets: &'a [String],
}

/// Pushes entities and their new units to a remote API.
pub struct ApiSink {
    client: reqwest::Client,
    base_url: String,
    token: Secret,
}

impl ApiSink {
    pub fn new(base_url: &str, token: Secret, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorySyncError::config(format!("failed to build API client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<R>> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| StorySyncError::Sink(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorySyncError::Sink(format!("POST {url}: HTTP {status}")));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| StorySyncError::Sink(format!("POST {url}: {e}")))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorySyncError::Sink(format!("POST {url}: unexpected response: {e}")))
    }

    async fn publish_record(&self, record: &EntityRecord, report: &mut SinkReport) -> Result<()> {
        let id = record.id().as_str();
        let check: CheckResponse = self
            .post(
                "/check",
                &CheckRequest {
                    id,
                    name: &record.descriptor.title,
                },
            )
            .await?
            .ok_or_else(|| StorySyncError::Sink(format!("empty check response for {id}")))?;

        let remote_id = match (check.exists, check.id) {
            (true, Some(remote_id)) => remote_id,
            (true, None) => id.to_string(),
            (false, _) => {
                let d = &record.descriptor;
                let created: CreateResponse = self
                    .post(
                        "/create",
                        &CreateRequest {
                            id,
                            name: &d.title,
                            author: &d.author,
                            cover: &d.thumbnail_url,
                            description: &d.description,
                        },
                    )
                    .await?
                    .ok_or_else(|| StorySyncError::Sink(format!("empty create response for {id}")))?;
                report.entities_created += 1;
                debug!(entity_id = id, remote_id = %created.id, "entity created");
                created.id
            }
        };

        let known: HashSet<String> = check.units.iter().map(|n| normalize_name(n)).collect();
        for unit in record
            .units
            .iter()
            .filter(|u| !known.contains(&u.normalized_name()))
        {
            self.post::<_, serde_json::Value>(
                "/add-unit",
                &AddUnitRequest {
                    id: &remote_id,
                    unit_name: &unit.name,
                    ordinal: unit.ordinal,
                    assets: &unit.asset_urls,
                },
            )
            .await?;
            report.units_added += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for ApiSink {
    fn name(&self) -> &str {
        "api"
    }

    #[instrument(skip_all, fields(records = snapshot.records.len()))]
    async fn publish(&self, snapshot: &Snapshot) -> Result<SinkReport> {
        let mut report = SinkReport::default();
        for record in &snapshot.records {
            self.publish_record(record, &mut report).await?;
        }
        info!(
            entities_created = report.entities_created,
            units_added = report.units_added,
            "API sink up to date"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storysync_shared::{EntityDescriptor, EntityId, Unit};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unit(ordinal: u32, name: &str) -> Unit {
        Unit {
            ordinal,
            name: name.into(),
            asset_urls: vec![format!("https://img.example.com/{ordinal}.jpg")],
        }
    }

    fn snapshot(id: &str, units: Vec<Unit>) -> Snapshot {
        let mut record = EntityRecord::new(EntityDescriptor {
            id: EntityId::new(id),
            title: format!("Title {id}"),
            author: "Author".into(),
            description: "About".into(),
            thumbnail_url: "https://cdn.example.com/t.jpg".into(),
        });
        record.units = units;
        Snapshot::new(vec![record])
    }

    fn sink(server: &MockServer) -> ApiSink {
        ApiSink::new(&server.uri(), Secret::new("t0ken"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn new_entity_is_created_then_units_added() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .and(header("authorization", "Bearer t0ken"))
            .and(body_partial_json(json!({"id": "berserk"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"exists": false})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/create"))
            .and(body_partial_json(json!({"name": "Title berserk", "cover": "https://cdn.example.com/t.jpg"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/add-unit"))
            .and(body_partial_json(json!({"id": "r-1"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;

        let report = sink(&server)
            .publish(&snapshot("berserk", vec![unit(1, "Chapter 1"), unit(2, "Chapter 2")]))
            .await
            .unwrap();
        assert_eq!(report.entities_created, 1);
        assert_eq!(report.units_added, 2);
    }

    #[tokio::test]
    async fn known_units_are_not_sent_again() {
        let server = MockServer::start().await;
        Mock::given(path("/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"exists": true, "id": "r-9", "units": ["chapter  1"]}),
            ))
            .mount(&server)
            .await;
        Mock::given(path("/create"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(path("/add-unit"))
            .and(body_partial_json(json!({"id": "r-9", "unitName": "Chapter 2", "ordinal": 2})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let report = sink(&server)
            .publish(&snapshot("x", vec![unit(1, "Chapter 1"), unit(2, "Chapter 2")]))
            .await
            .unwrap();
        assert_eq!(report.entities_created, 0);
        assert_eq!(report.units_added, 1);
    }

    #[tokio::test]
    async fn http_error_is_a_sink_error_without_token() {
        let server = MockServer::start().await;
        Mock::given(path("/check"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = sink(&server)
            .publish(&snapshot("x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorySyncError::Sink(_)));
        assert!(!err.to_string().contains("t0ken"));
    }
}
