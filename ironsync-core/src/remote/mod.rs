//! Client for the hosted API. Every payload is keyed by a client-generated
//! id, so the collaborator is expected to treat repeated identical writes as
//! safe upserts; retries simply resend the same body.
//!
//! The mock backend exists for tests: a closure decides each request's fate
//! and every request is recorded for later assertions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::{EntityType, OperationType, QueueItem, Session, SetRecord};

/// Bound on each sync call, so a hung request fails the item instead of
/// stalling the whole phase.
pub const SYNC_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid queue payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("mock rejection: {0}")]
    Mock(String),
}

fn rfc3339(unix_seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0)
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339()
}

/// Body of `PUT /sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpsert {
    pub id: String,
    pub athlete_id: String,
    pub workout_plan_id: String,
    pub assignment_id: Option<String>,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub notes: Option<String>,
}

impl From<&Session> for SessionUpsert {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            athlete_id: session.athlete_id.clone(),
            workout_plan_id: session.workout_plan_id.clone(),
            assignment_id: session.assignment_id.clone(),
            status: session.status.to_string(),
            started_at: rfc3339(session.started_at),
            completed_at: session.completed_at.map(rfc3339),
            notes: session.notes.clone(),
        }
    }
}

/// One entry of the `POST /sessions/{id}/sets` batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCreate {
    pub id: String,
    pub session_id: String,
    pub session_exercise_id: String,
    pub set_number: i64,
    pub weight: Option<f64>,
    pub reps: i64,
    pub rpe: Option<f64>,
    pub notes: Option<String>,
    pub completed_at: String,
}

impl From<&SetRecord> for SetCreate {
    fn from(record: &SetRecord) -> Self {
        Self {
            id: record.id.clone(),
            session_id: record.session_id.clone(),
            session_exercise_id: record.session_exercise_id.clone(),
            set_number: record.set_number,
            weight: record.weight_used,
            reps: record.reps_completed,
            rpe: record.rpe,
            notes: record.notes.clone(),
            completed_at: rfc3339(record.completed_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBatch {
    pub sets: Vec<SetCreate>,
}

/// What the sync engine asked the remote to do; the unit the mock backend
/// sees and records.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRequest {
    UpsertSession(SessionUpsert),
    CreateSets {
        session_id: String,
        batch: SetBatch,
    },
    Dispatch {
        operation: OperationType,
        entity: EntityType,
        entity_id: String,
        payload: serde_json::Value,
    },
}

type MockFn = Arc<dyn Fn(&RemoteRequest) -> Result<(), RemoteError> + Send + Sync>;

enum RemoteBackend {
    Http {
        base_url: String,
        client: reqwest::Client,
    },
    Mock {
        responder: MockFn,
        recorded: Arc<Mutex<Vec<RemoteRequest>>>,
    },
}

pub struct RemoteClient {
    backend: RemoteBackend,
}

impl RemoteClient {
    pub fn new_http(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SYNC_CALL_TIMEOUT)
            .build()?;
        Ok(Self {
            backend: RemoteBackend::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                client,
            },
        })
    }

    /// Mock backend with a closure responder, for tests.
    pub fn new_mock_fn(
        f: impl Fn(&RemoteRequest) -> Result<(), RemoteError> + Send + Sync + 'static,
    ) -> Self {
        debug!("RemoteClient::new_mock_fn creating mock backend");
        Self {
            backend: RemoteBackend::Mock {
                responder: Arc::new(f),
                recorded: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    /// Mock backend that accepts everything.
    pub fn new_mock_ok() -> Self {
        Self::new_mock_fn(|_| Ok(()))
    }

    /// Requests seen by the mock backend, in order. Empty for HTTP.
    pub fn recorded_requests(&self) -> Vec<RemoteRequest> {
        match &self.backend {
            RemoteBackend::Http { .. } => Vec::new(),
            RemoteBackend::Mock { recorded, .. } => {
                recorded.lock().unwrap_or_else(|e| e.into_inner()).clone()
            }
        }
    }

    pub async fn upsert_session(&self, body: &SessionUpsert) -> Result<(), RemoteError> {
        let request = RemoteRequest::UpsertSession(body.clone());
        match &self.backend {
            RemoteBackend::Http { base_url, client } => {
                let url = format!("{}/sessions/{}", base_url, body.id);
                debug!("PUT {}", url);
                let response = client.put(&url).json(body).send().await?;
                Self::check_status(response).await
            }
            RemoteBackend::Mock { .. } => self.mock_call(request),
        }
    }

    pub async fn create_sets(
        &self,
        session_id: &str,
        batch: &SetBatch,
    ) -> Result<(), RemoteError> {
        let request = RemoteRequest::CreateSets {
            session_id: session_id.to_string(),
            batch: batch.clone(),
        };
        match &self.backend {
            RemoteBackend::Http { base_url, client } => {
                let url = format!("{}/sessions/{}/sets", base_url, session_id);
                debug!("POST {} ({} sets)", url, batch.sets.len());
                let response = client.post(&url).json(batch).send().await?;
                Self::check_status(response).await
            }
            RemoteBackend::Mock { .. } => self.mock_call(request),
        }
    }

    /// Generic queue dispatch: (operation, entity) chooses the verb and path.
    pub async fn dispatch(&self, item: &QueueItem) -> Result<(), RemoteError> {
        let payload: serde_json::Value = serde_json::from_str(&item.payload)?;
        let request = RemoteRequest::Dispatch {
            operation: item.operation_type,
            entity: item.entity_type,
            entity_id: item.entity_id.clone(),
            payload: payload.clone(),
        };
        match &self.backend {
            RemoteBackend::Http { base_url, client } => {
                let collection = item.entity_type.collection();
                let response = match item.operation_type {
                    OperationType::Create => {
                        let url = format!("{}/{}", base_url, collection);
                        debug!("POST {}", url);
                        client.post(&url).json(&payload).send().await?
                    }
                    OperationType::Update => {
                        let url = format!("{}/{}/{}", base_url, collection, item.entity_id);
                        debug!("PATCH {}", url);
                        client.patch(&url).json(&payload).send().await?
                    }
                    OperationType::Delete => {
                        let url = format!("{}/{}/{}", base_url, collection, item.entity_id);
                        debug!("DELETE {}", url);
                        client.delete(&url).send().await?
                    }
                };
                Self::check_status(response).await
            }
            RemoteBackend::Mock { .. } => self.mock_call(request),
        }
    }

    fn mock_call(&self, request: RemoteRequest) -> Result<(), RemoteError> {
        match &self.backend {
            RemoteBackend::Mock {
                responder,
                recorded,
            } => {
                recorded
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(request.clone());
                responder(&request)
            }
            RemoteBackend::Http { .. } => unreachable!("mock_call on http backend"),
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<(), RemoteError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{QueueItem, Session, SessionStatus, SetRecord};

    #[test]
    fn session_upsert_payload_shape() {
        let mut session = Session::new("athlete-1", "plan-1", None);
        session.started_at = 1_760_000_000;
        session.status = SessionStatus::Completed;
        session.completed_at = Some(1_760_003_600);
        session.notes = Some("felt strong".into());

        let body = SessionUpsert::from(&session);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["athlete_id"], "athlete-1");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["started_at"], "2025-10-09T08:53:20+00:00");
        assert_eq!(json["completed_at"], "2025-10-09T09:53:20+00:00");
        assert_eq!(json["assignment_id"], serde_json::Value::Null);
    }

    #[test]
    fn set_batch_payload_shape() {
        let mut record = SetRecord::new("session-1", "exercise-1", 3, 5, Some(102.5), Some(9.0));
        record.completed_at = 1_760_000_000;

        let batch = SetBatch {
            sets: vec![SetCreate::from(&record)],
        };
        let json = serde_json::to_value(&batch).unwrap();

        assert_eq!(json["sets"][0]["session_id"], "session-1");
        assert_eq!(json["sets"][0]["set_number"], 3);
        assert_eq!(json["sets"][0]["weight"], 102.5);
        assert_eq!(json["sets"][0]["reps"], 5);
        assert_eq!(json["sets"][0]["completed_at"], "2025-10-09T08:53:20+00:00");
    }

    #[tokio::test]
    async fn mock_records_requests_and_rejects() {
        let client = RemoteClient::new_mock_fn(|request| match request {
            RemoteRequest::Dispatch { .. } => Err(RemoteError::Mock("nope".into())),
            _ => Ok(()),
        });

        let session = Session::new("athlete-1", "plan-1", None);
        client
            .upsert_session(&SessionUpsert::from(&session))
            .await
            .unwrap();

        let item = QueueItem::new(
            OperationType::Delete,
            EntityType::Set,
            "set-1",
            &serde_json::json!({ "id": "set-1" }),
        );
        assert!(client.dispatch(&item).await.is_err());

        let recorded = client.recorded_requests();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(recorded[0], RemoteRequest::UpsertSession(_)));
        assert!(matches!(
            recorded[1],
            RemoteRequest::Dispatch {
                operation: OperationType::Delete,
                entity: EntityType::Set,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_queue_payload_is_an_error() {
        let client = RemoteClient::new_mock_ok();
        let mut item = QueueItem::new(
            OperationType::Create,
            EntityType::Exercise,
            "ex-1",
            &serde_json::json!({}),
        );
        item.payload = "{not json".into();
        assert!(matches!(
            client.dispatch(&item).await,
            Err(RemoteError::Payload(_))
        ));
        // The request never reached the responder.
        assert!(client.recorded_requests().is_empty());
    }
}
