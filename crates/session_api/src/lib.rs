//! Use-case layer for the live presentation service: the session
//! controller (sole writer of a topic's session row), the feedback store
//! operations, and snapshot assembly. HTTP and socket plumbing live in
//! the server crate; everything here returns structured `ApiError`s.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use shared::{
    domain::{
        FeedbackKind, ProjectId, Reviewer, ReviewerKind, Role, TopicId, UserId, Viewer,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        FeedbackPayload, LiveSnapshot, MemberPayload, ProjectSummary, ReviewerPayload,
        ScoreAggregate, ScorePayload, ServerEvent, TopicSummary,
    },
    session::{remaining_ms, ActiveSession, TransitionError},
};
use storage::{Storage, StoredFeedback, StoredProject, StoredScore, StoredTopic};
use tracing::debug;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub struct NewTopic {
    pub title: String,
    pub config: shared::domain::SessionConfig,
    pub submit_open_at: Option<chrono::DateTime<Utc>>,
    pub submit_close_at: Option<chrono::DateTime<Utc>>,
}

pub struct NewProject {
    pub title: String,
    pub repo_url: Option<String>,
    pub demo_url: Option<String>,
    pub members: Vec<MemberPayload>,
}

pub async fn create_topic(
    ctx: &ApiContext,
    actor: UserId,
    topic: NewTopic,
) -> Result<TopicId, ApiError> {
    let role = ctx
        .storage
        .user_role(actor)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown user"))?;
    if role != Role::Teacher {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only teachers may create topics",
        ));
    }
    if topic.title.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "title cannot be empty"));
    }
    ctx.storage
        .create_topic(
            actor,
            topic.title.trim(),
            &topic.config,
            topic.submit_open_at,
            topic.submit_close_at,
        )
        .await
        .map_err(internal)
}

pub async fn create_project(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
    project: NewProject,
) -> Result<ProjectId, ApiError> {
    ctx.storage
        .user_role(actor)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown user"))?;
    let topic = load_topic(ctx, topic_id).await?;

    let now = Utc::now();
    if let Some(open_at) = topic.submit_open_at {
        if now < open_at {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "submissions are not open yet",
            ));
        }
    }
    if let Some(close_at) = topic.submit_close_at {
        if now > close_at {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "the submission window has closed",
            ));
        }
    }

    if project.title.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "title cannot be empty"));
    }
    if project
        .members
        .iter()
        .any(|member| member.display_name.trim().is_empty())
    {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "every team member needs a display name",
        ));
    }

    let members: Vec<storage::StoredMember> = project
        .members
        .into_iter()
        .map(|member| storage::StoredMember {
            user_id: member.user_id,
            display_name: member.display_name,
            email: member.email,
            student_no: member.student_no,
        })
        .collect();

    ctx.storage
        .create_project(
            topic_id,
            project.title.trim(),
            project.repo_url.as_deref(),
            project.demo_url.as_deref(),
            &members,
        )
        .await
        .map_err(internal)
}

pub async fn list_projects(
    ctx: &ApiContext,
    viewer: &Viewer,
    topic_id: TopicId,
) -> Result<Vec<ProjectSummary>, ApiError> {
    if matches!(viewer, Viewer::Guest) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "the project queue is not visible to guests",
        ));
    }
    load_topic(ctx, topic_id).await?;
    let projects = ctx
        .storage
        .list_projects(topic_id)
        .await
        .map_err(internal)?;
    let mut summaries = Vec::with_capacity(projects.len());
    for project in projects {
        summaries.push(project_summary(ctx, project).await?);
    }
    Ok(summaries)
}

//=== session controller ==================================================

pub async fn start_session(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
    first_project: Option<ProjectId>,
) -> Result<ServerEvent, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let session = load_session(ctx, topic_id).await?;

    let first = match first_project {
        Some(project_id) => {
            let project = ctx
                .storage
                .load_project(project_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "project not found"))?;
            if project.topic_id != topic_id {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "project does not belong to topic",
                ));
            }
            project_id
        }
        None => ctx
            .storage
            .first_project(topic_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                ApiError::new(ErrorCode::NotFound, "topic has no submitted projects")
            })?,
    };

    let next = session
        .start(first, Utc::now())
        .map_err(transition_rejected)?;
    commit(ctx, topic_id, &session, &next).await?;
    Ok(session_event(topic_id, next))
}

pub async fn advance_phase(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
) -> Result<ServerEvent, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let session = load_session(ctx, topic_id).await?;

    // Only the break -> presentation edge consumes the queue.
    let next_project = match (session.phase, session.current_project_id) {
        (shared::domain::SessionPhase::Break, Some(current)) => ctx
            .storage
            .next_project_after(topic_id, current)
            .await
            .map_err(internal)?,
        _ => None,
    };

    let next = session
        .advance(next_project, Utc::now())
        .map_err(transition_rejected)?;
    commit(ctx, topic_id, &session, &next).await?;
    Ok(session_event(topic_id, next))
}

pub async fn pause_session(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
) -> Result<ServerEvent, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let session = load_session(ctx, topic_id).await?;
    let next = session.pause(Utc::now()).map_err(transition_rejected)?;
    commit(ctx, topic_id, &session, &next).await?;
    Ok(session_event(topic_id, next))
}

pub async fn resume_session(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
) -> Result<ServerEvent, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let session = load_session(ctx, topic_id).await?;
    let next = session.resume(Utc::now()).map_err(transition_rejected)?;
    commit(ctx, topic_id, &session, &next).await?;
    Ok(session_event(topic_id, next))
}

pub async fn end_session(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
) -> Result<ServerEvent, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let session = load_session(ctx, topic_id).await?;
    let next = session.end().map_err(transition_rejected)?;
    commit(ctx, topic_id, &session, &next).await?;
    Ok(session_event(topic_id, next))
}

//=== live snapshot =======================================================

pub async fn live_snapshot(
    ctx: &ApiContext,
    viewer: &Viewer,
    topic_id: TopicId,
) -> Result<LiveSnapshot, ApiError> {
    let topic = load_topic(ctx, topic_id).await?;
    ensure_channel_access(viewer, &topic)?;
    let session = load_session(ctx, topic_id).await?;

    let current_project = match session.current_project_id {
        Some(project_id) => {
            let project = ctx
                .storage
                .load_project(project_id)
                .await
                .map_err(internal)?;
            match project {
                Some(project) => Some(project_summary(ctx, project).await?),
                None => None,
            }
        }
        None => None,
    };

    let remaining = remaining_ms(&session, &topic.config, Utc::now());
    Ok(LiveSnapshot {
        topic: TopicSummary {
            topic_id: topic.topic_id,
            owner_user_id: topic.owner_user_id,
            title: topic.title,
        },
        config: topic.config,
        session,
        current_project,
        remaining_ms: remaining,
    })
}

/// Guests may only enter channels whose topic opted in.
pub fn ensure_channel_access(viewer: &Viewer, topic: &StoredTopic) -> Result<(), ApiError> {
    match viewer {
        Viewer::Registered { .. } => Ok(()),
        Viewer::Guest if topic.config.allow_guest => Ok(()),
        Viewer::Guest => Err(ApiError::new(
            ErrorCode::Forbidden,
            "guest access is not enabled for this topic",
        )),
    }
}

//=== feedback ============================================================

pub async fn submit_feedback(
    ctx: &ApiContext,
    topic_id: TopicId,
    project_id: ProjectId,
    reviewer: Reviewer,
    feedback_kind: FeedbackKind,
    comment: Option<String>,
    scores: Vec<ScorePayload>,
) -> Result<ServerEvent, ApiError> {
    let topic = load_topic(ctx, topic_id).await?;
    let project = ctx
        .storage
        .load_project(project_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "project not found"))?;
    if project.topic_id != topic_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "project does not belong to topic",
        ));
    }

    let reviewer_kind = match &reviewer {
        Reviewer::Registered { user_id } => {
            let role = ctx
                .storage
                .user_role(*user_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown user"))?;
            match role {
                Role::Teacher => ReviewerKind::Teacher,
                Role::Student => ReviewerKind::Student,
            }
        }
        Reviewer::Guest { name, .. } => {
            if !topic.config.allow_guest {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "guest access is not enabled for this topic",
                ));
            }
            if name.trim().is_empty() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "guest name cannot be empty",
                ));
            }
            ReviewerKind::Guest
        }
    };

    let session = load_session(ctx, topic_id).await?;
    if session.status != shared::domain::SessionStatus::Active {
        return Err(ApiError::new(
            ErrorCode::SessionClosed,
            "the session is not accepting feedback",
        ));
    }
    if topic.config.feedback_window == shared::domain::FeedbackWindow::QaOnly
        && session.phase != shared::domain::SessionPhase::Qa
    {
        return Err(ApiError::new(
            ErrorCode::SessionClosed,
            "feedback is only accepted during q&a",
        ));
    }

    let comment = comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    if comment.is_none() && scores.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "feedback needs a comment or at least one score",
        ));
    }

    let stored_scores: Vec<StoredScore> = scores
        .iter()
        .map(|score| StoredScore {
            label: score.label.clone(),
            score: score.score,
            text_value: score.text_value.clone(),
        })
        .collect();

    let feedback_id = ctx
        .storage
        .insert_feedback(
            topic_id,
            project_id,
            &reviewer,
            reviewer_kind,
            feedback_kind,
            comment.as_deref(),
            &stored_scores,
            topic.config.max_comments_per_project,
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::RateLimited,
                "comment limit reached for this project",
            )
        })?;

    debug!(topic_id = topic_id.0, project_id = project_id.0, "feedback accepted");

    let username = match &reviewer {
        Reviewer::Registered { user_id } => ctx
            .storage
            .username_for_user(*user_id)
            .await
            .map_err(internal)?,
        Reviewer::Guest { .. } => None,
    };
    let entry = FeedbackPayload {
        feedback_id,
        project_id,
        reviewer: reviewer_payload(&reviewer, username),
        reviewer_kind,
        feedback_kind,
        comment,
        scores,
        submitted_at: Utc::now(),
    };
    Ok(ServerEvent::FeedbackReceived {
        topic_id,
        project_id,
        entry,
    })
}

pub async fn list_feedback(
    ctx: &ApiContext,
    viewer: &Viewer,
    topic_id: TopicId,
    project_id: ProjectId,
) -> Result<Vec<FeedbackPayload>, ApiError> {
    let topic = load_topic(ctx, topic_id).await?;
    let project = ctx
        .storage
        .load_project(project_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "project not found"))?;
    if project.topic_id != topic_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "project does not belong to topic",
        ));
    }

    // Hidden, not forbidden: roles without visibility read an empty list.
    if !feedback_visible_to(viewer, &topic) {
        return Ok(Vec::new());
    }

    let entries = ctx
        .storage
        .list_feedback_for_project(project_id)
        .await
        .map_err(internal)?;

    let mut username_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut payloads = Vec::with_capacity(entries.len());
    for entry in entries {
        let username = match &entry.reviewer {
            Reviewer::Registered { user_id } => {
                if let Some(cached) = username_cache.get(user_id) {
                    cached.clone()
                } else {
                    let resolved = ctx
                        .storage
                        .username_for_user(*user_id)
                        .await
                        .map_err(internal)?;
                    username_cache.insert(*user_id, resolved.clone());
                    resolved
                }
            }
            Reviewer::Guest { .. } => None,
        };
        payloads.push(feedback_payload(entry, username));
    }
    Ok(payloads)
}

pub async fn feedback_summary(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
    project_id: ProjectId,
) -> Result<Vec<ScoreAggregate>, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    let project = ctx
        .storage
        .load_project(project_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "project not found"))?;
    if project.topic_id != topic_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "project does not belong to topic",
        ));
    }

    let aggregates = ctx
        .storage
        .aggregate_scores(project_id)
        .await
        .map_err(internal)?;
    Ok(aggregates
        .into_iter()
        .map(|row| ScoreAggregate {
            label: row.label,
            samples: row.samples,
            mean: row.mean,
            total: row.total,
        })
        .collect())
}

fn feedback_visible_to(viewer: &Viewer, topic: &StoredTopic) -> bool {
    let visibility = &topic.config.feedback_visibility;
    match viewer {
        Viewer::Registered { user_id, .. } if *user_id == topic.owner_user_id => true,
        Viewer::Registered {
            role: Role::Teacher,
            ..
        } => visibility.teacher,
        Viewer::Registered {
            role: Role::Student,
            ..
        } => visibility.student,
        Viewer::Guest => topic.config.allow_guest && visibility.guest,
    }
}

//=== access keys =========================================================

const ACCESS_KEY_PREFIX: &str = "topic:";

/// Mints the opaque share code guests join with. Owner only.
pub async fn share_topic(
    ctx: &ApiContext,
    actor: UserId,
    topic_id: TopicId,
) -> Result<String, ApiError> {
    ensure_topic_owner(ctx, topic_id, actor).await?;
    Ok(access_key_for_topic(topic_id))
}

pub fn access_key_for_topic(topic_id: TopicId) -> String {
    URL_SAFE_NO_PAD.encode(format!("{ACCESS_KEY_PREFIX}{}", topic_id.0))
}

pub fn topic_for_access_key(access_key: &str) -> Result<TopicId, ApiError> {
    let invalid = || ApiError::new(ErrorCode::Validation, "invalid access key");
    let decoded = URL_SAFE_NO_PAD
        .decode(access_key.as_bytes())
        .map_err(|_| invalid())?;
    let decoded_text = String::from_utf8(decoded).map_err(|_| invalid())?;
    decoded_text
        .strip_prefix(ACCESS_KEY_PREFIX)
        .and_then(|id| id.parse::<i64>().ok())
        .map(TopicId)
        .ok_or_else(invalid)
}

//=== helpers =============================================================

async fn load_topic(ctx: &ApiContext, topic_id: TopicId) -> Result<StoredTopic, ApiError> {
    ctx.storage
        .load_topic(topic_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "topic not found"))
}

async fn load_session(ctx: &ApiContext, topic_id: TopicId) -> Result<ActiveSession, ApiError> {
    ctx.storage
        .load_session(topic_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "topic not found"))
}

async fn ensure_topic_owner(
    ctx: &ApiContext,
    topic_id: TopicId,
    actor: UserId,
) -> Result<StoredTopic, ApiError> {
    let topic = load_topic(ctx, topic_id).await?;
    if topic.owner_user_id != actor {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the topic owner may control the session",
        ));
    }
    Ok(topic)
}

async fn commit(
    ctx: &ApiContext,
    topic_id: TopicId,
    expected: &ActiveSession,
    next: &ActiveSession,
) -> Result<(), ApiError> {
    let committed = ctx
        .storage
        .commit_session_transition(topic_id, expected, next)
        .await
        .map_err(internal)?;
    if !committed {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "the session changed concurrently; refetch and retry",
        ));
    }
    debug!(
        topic_id = topic_id.0,
        status = ?next.status,
        phase = ?next.phase,
        "session transition committed"
    );
    Ok(())
}

fn session_event(topic_id: TopicId, session: ActiveSession) -> ServerEvent {
    ServerEvent::SessionUpdated { topic_id, session }
}

fn transition_rejected(err: TransitionError) -> ApiError {
    ApiError::new(ErrorCode::InvalidTransition, err.to_string())
}

async fn project_summary(
    ctx: &ApiContext,
    project: StoredProject,
) -> Result<ProjectSummary, ApiError> {
    let members = ctx
        .storage
        .members_for_project(project.project_id)
        .await
        .map_err(internal)?;
    Ok(ProjectSummary {
        project_id: project.project_id,
        topic_id: project.topic_id,
        title: project.title,
        queue_order: project.queue_order,
        repo_url: project.repo_url,
        demo_url: project.demo_url,
        members: members
            .into_iter()
            .map(|member| MemberPayload {
                user_id: member.user_id,
                display_name: member.display_name,
                email: member.email,
                student_no: member.student_no,
            })
            .collect(),
    })
}

fn reviewer_payload(reviewer: &Reviewer, username: Option<String>) -> ReviewerPayload {
    match reviewer {
        Reviewer::Registered { user_id } => ReviewerPayload::Registered {
            user_id: *user_id,
            username,
        },
        Reviewer::Guest { guest_id, name } => ReviewerPayload::Guest {
            guest_id: *guest_id,
            name: name.clone(),
        },
    }
}

fn feedback_payload(entry: StoredFeedback, username: Option<String>) -> FeedbackPayload {
    FeedbackPayload {
        feedback_id: entry.feedback_id,
        project_id: entry.project_id,
        reviewer: reviewer_payload(&entry.reviewer, username),
        reviewer_kind: entry.reviewer_kind,
        feedback_kind: entry.feedback_kind,
        comment: entry.comment,
        scores: entry
            .scores
            .into_iter()
            .map(|score| ScorePayload {
                label: score.label,
                score: score.score,
                text_value: score.text_value,
            })
            .collect(),
        submitted_at: entry.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
