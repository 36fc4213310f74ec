use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{FeedbackId, FeedbackKind, ProjectId, ReviewerKind, SessionConfig, TopicId, UserId},
    error::ApiError,
    session::ActiveSession,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic_id: TopicId,
    pub owner_user_id: UserId,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: ProjectId,
    pub topic_id: TopicId,
    pub title: String,
    pub queue_order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demo_url: Option<String>,
    pub members: Vec<MemberPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_no: Option<String>,
}

/// One `{label, score, text}` tuple of an entry. Rubric scores carry a
/// number, survey answers may carry only text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePayload {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewerPayload {
    Registered {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    Guest {
        guest_id: Uuid,
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPayload {
    pub feedback_id: FeedbackId,
    pub project_id: ProjectId,
    pub reviewer: ReviewerPayload,
    pub reviewer_kind: ReviewerKind,
    pub feedback_kind: FeedbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub scores: Vec<ScorePayload>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub label: String,
    pub samples: i64,
    pub mean: f64,
    pub total: f64,
}

/// Snapshot served to joining clients; everything a console needs to
/// render without waiting for the next broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub topic: TopicSummary,
    pub config: SessionConfig,
    pub session: ActiveSession,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_project: Option<ProjectSummary>,
    pub remaining_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionUpdated {
        topic_id: TopicId,
        session: ActiveSession,
    },
    FeedbackReceived {
        topic_id: TopicId,
        project_id: ProjectId,
        entry: FeedbackPayload,
    },
    Error(ApiError),
}
