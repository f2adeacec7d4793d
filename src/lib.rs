use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod coordinator;
pub mod db;
pub mod fingerprint;
pub mod jobs;
pub mod lock;
pub mod memory;
pub mod render;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use coordinator::{Coordinator, JobHandle};
pub use fingerprint::{Fingerprint, PipelineVersion};
pub use jobs::JobStore;
pub use store::{KvStore, StoreError};
pub use worker::Worker;

pub const DEFAULT_DISTANCE: u32 = 18_000;
pub const DEFAULT_WIDTH: f64 = 12.0;
pub const DEFAULT_HEIGHT: f64 = 16.0;

/// What the caller intends to do with the image. Only shapes the API
/// response; the rendered pixels are the same for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Preview,
    Poster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub city: String,
    pub country: String,
    pub theme: String,
    pub kind: JobKind,
    pub distance: u32,
    pub width: f64,
    pub height: f64,
}

impl RenderRequest {
    pub fn new(city: &str, country: &str, theme: &str, kind: JobKind) -> Self {
        RenderRequest {
            city: city.into(),
            country: country.into(),
            theme: theme.into(),
            kind,
            distance: DEFAULT_DISTANCE,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }

    /// Trimmed place names, trimmed lowercase theme id.
    pub fn normalized(&self) -> Self {
        RenderRequest {
            city: self.city.trim().to_string(),
            country: self.country.trim().to_string(),
            theme: self.theme.trim().to_lowercase(),
            ..self.clone()
        }
    }

    /// Bounds checks mirroring what the HTTP layer enforces before a job exists.
    pub fn validate(&self) -> Result<(), String> {
        let req = self.normalized();
        let len_ok = |s: &str, max: usize| (1..=max).contains(&s.chars().count());
        if !len_ok(&req.city, 120) {
            return Err("city must be 1 to 120 characters".into());
        }
        if !len_ok(&req.country, 120) {
            return Err("country must be 1 to 120 characters".into());
        }
        if !len_ok(&req.theme, 64) {
            return Err("theme must be 1 to 64 characters".into());
        }
        if !(1_000..=30_000).contains(&req.distance) {
            return Err("distance must be between 1000 and 30000".into());
        }
        for (name, value) in [("width", req.width), ("height", req.height)] {
            if !(value > 0.0 && value <= 20.0) {
                return Err(format!("{name} must be in (0, 20]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One request's progress through rendering, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub city: String,
    pub country: String,
    pub theme: String,
    pub distance: u32,
    pub width: f64,
    pub height: f64,
    pub asset_url: Option<String>,
    pub preview_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(request: &RenderRequest, fingerprint: Fingerprint) -> Self {
        let request = request.normalized();
        let now = Utc::now();
        JobRecord {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            fingerprint,
            kind: request.kind,
            city: request.city,
            country: request.country,
            theme: request.theme,
            distance: request.distance,
            width: request.width,
            height: request.height,
            asset_url: None,
            preview_url: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn request(&self) -> RenderRequest {
        RenderRequest {
            city: self.city.clone(),
            country: self.country.clone(),
            theme: self.theme.clone(),
            kind: self.kind,
            distance: self.distance,
            width: self.width,
            height: self.height,
        }
    }

    fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        // Clock skew between instances must not move updated_at backwards.
        self.updated_at = Utc::now().max(self.updated_at);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.advance(JobStatus::Running)
    }

    pub fn complete(&mut self, asset_url: &str) -> Result<(), TransitionError> {
        self.advance(JobStatus::Completed)?;
        self.asset_url = Some(asset_url.to_string());
        self.preview_url = Some(asset_url.to_string());
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<(), TransitionError> {
        self.advance(JobStatus::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        let req = RenderRequest::new(" Paris ", "France", " Noir", JobKind::Poster);
        JobRecord::new(&req, Fingerprint::from_hex("ab".repeat(20)))
    }

    #[test]
    fn new_record_is_queued_and_normalized() {
        let job = record();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.city, "Paris");
        assert_eq!(job.theme, "noir");
        assert!(job.asset_url.is_none() && job.error.is_none());
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut job = record();
        assert!(job.complete("/x.png").is_err());
        assert!(job.fail("boom").is_err());
        job.start().unwrap();
        assert!(job.start().is_err());
        job.complete("/v1/assets/x.png").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.asset_url.as_deref(), Some("/v1/assets/x.png"));
        assert_eq!(job.preview_url, job.asset_url);
        let err = job.fail("late").unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_records_error_without_asset() {
        let mut job = record();
        job.start().unwrap();
        let before = job.updated_at;
        job.fail("renderer exploded").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("renderer exploded"));
        assert!(job.asset_url.is_none());
        assert!(job.updated_at >= before);
    }

    #[test]
    fn record_json_uses_camel_case() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["kind"], "poster");
        assert!(json.get("jobId").is_some());
        assert!(json.get("assetUrl").is_some());
    }

    #[test]
    fn validation_bounds() {
        let mut req = RenderRequest::new("Paris", "France", "noir", JobKind::Preview);
        assert!(req.validate().is_ok());
        req.distance = 500;
        assert!(req.validate().is_err());
        req.distance = 18_000;
        req.width = 0.0;
        assert!(req.validate().is_err());
        req.width = 12.0;
        req.city = "   ".into();
        assert!(req.validate().is_err());
    }
}
