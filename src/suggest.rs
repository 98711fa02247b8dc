//! Boundary to the generative suggestion service.
//!
//! The service is best-effort: failures surface only to the foreground
//! "analyze now" flow and never affect checklist availability. Everything it
//! returns is loosely typed and normalised before it reaches a `Task`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::fields::{parse_category, parse_priority};
use crate::gaps::StandardGap;
use crate::task::NewTask;
use crate::trip::Trip;

/// Input to the suggestion service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    pub trip: Trip,
    pub existing_titles: Vec<String>,
    pub gaps: Vec<StandardGap>,
}

/// A task proposed by the service, with unvalidated category/priority strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

impl SuggestedTask {
    /// Normalise into a task-creation request.
    pub fn into_new_task(self) -> NewTask {
        let priority = parse_priority(self.priority.as_deref().unwrap_or_default());
        NewTask {
            title: self.title,
            description: self.description,
            due_date: self.due_date,
            category: parse_category(self.category.as_deref().unwrap_or_default()),
            priority,
            is_urgent: priority == crate::fields::Priority::Blocking,
        }
    }
}

/// Output of the suggestion service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResponse {
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub suggested_tasks: Vec<SuggestedTask>,
}

#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestionResponse>;
}

/// HTTP client posting `SuggestionRequest` JSON to a single endpoint.
#[derive(Debug, Clone)]
pub struct HttpSuggestionService {
    client: Client,
    url: String,
}

impl HttpSuggestionService {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("HTTP client: {e}")))?;
        Ok(HttpSuggestionService {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionService {
    #[instrument(skip(self, request), fields(trip = %request.trip.id))]
    async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestionResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Suggestion(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Suggestion(format!("service returned {}", response.status())));
        }
        let body: SuggestionResponse = response
            .json()
            .await
            .map_err(|e| Error::Suggestion(format!("unreadable response: {e}")))?;
        debug!(
            insights = body.insights.len(),
            suggestions = body.suggested_tasks.len(),
            "Received suggestions"
        );
        Ok(body)
    }
}
