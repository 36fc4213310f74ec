use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{
        FeedbackId, FeedbackKind, FeedbackVisibility, FeedbackWindow, GradingKind, ProjectId,
        Reviewer, ReviewerKind, Role, SessionConfig, SessionPhase, SessionStatus, TopicId, UserId,
    },
    session::ActiveSession,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredTopic {
    pub topic_id: TopicId,
    pub owner_user_id: UserId,
    pub title: String,
    pub config: SessionConfig,
    pub submit_open_at: Option<DateTime<Utc>>,
    pub submit_close_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredProject {
    pub project_id: ProjectId,
    pub topic_id: TopicId,
    pub title: String,
    pub queue_order: i64,
    pub repo_url: Option<String>,
    pub demo_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub email: Option<String>,
    pub student_no: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredScore {
    pub label: String,
    pub score: Option<f64>,
    pub text_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredFeedback {
    pub feedback_id: FeedbackId,
    pub topic_id: TopicId,
    pub project_id: ProjectId,
    pub reviewer: Reviewer,
    pub reviewer_kind: ReviewerKind,
    pub feedback_kind: FeedbackKind,
    pub comment: Option<String>,
    pub scores: Vec<StoredScore>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AggregatedScore {
    pub label: String,
    pub samples: i64,
    pub mean: f64,
    pub total: f64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, role: Role) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, role) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET role=excluded.role
             RETURNING id",
        )
        .bind(username)
        .bind(role_str(role))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_role(&self, user_id: UserId) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT role FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| parse_role(&r.get::<String, _>(0))))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Creates the topic together with its single `idle` session row.
    pub async fn create_topic(
        &self,
        owner_user_id: UserId,
        title: &str,
        config: &SessionConfig,
        submit_open_at: Option<DateTime<Utc>>,
        submit_close_at: Option<DateTime<Utc>>,
    ) -> Result<TopicId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO topics (
                owner_user_id, title, submit_open_at, submit_close_at,
                duration_per_project_min, question_duration_min, break_duration_min,
                grading, allow_guest, feedback_window, max_comments_per_project,
                feedback_visible_teacher, feedback_visible_student, feedback_visible_guest
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(owner_user_id.0)
        .bind(title)
        .bind(submit_open_at)
        .bind(submit_close_at)
        .bind(config.duration_per_project_min)
        .bind(config.question_duration_min)
        .bind(config.break_duration_min)
        .bind(grading_str(config.grading))
        .bind(config.allow_guest)
        .bind(window_str(config.feedback_window))
        .bind(config.max_comments_per_project as i64)
        .bind(config.feedback_visibility.teacher)
        .bind(config.feedback_visibility.student)
        .bind(config.feedback_visibility.guest)
        .fetch_one(&mut *tx)
        .await?;
        let topic_id = TopicId(rec.get::<i64, _>(0));

        sqlx::query("INSERT INTO active_sessions (topic_id) VALUES (?)")
            .bind(topic_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(topic_id)
    }

    pub async fn load_topic(&self, topic_id: TopicId) -> Result<Option<StoredTopic>> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, title, submit_open_at, submit_close_at,
                    duration_per_project_min, question_duration_min, break_duration_min,
                    grading, allow_guest, feedback_window, max_comments_per_project,
                    feedback_visible_teacher, feedback_visible_student, feedback_visible_guest
             FROM topics WHERE id = ?",
        )
        .bind(topic_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredTopic {
            topic_id: TopicId(r.get::<i64, _>(0)),
            owner_user_id: UserId(r.get::<i64, _>(1)),
            title: r.get::<String, _>(2),
            submit_open_at: r.get::<Option<DateTime<Utc>>, _>(3),
            submit_close_at: r.get::<Option<DateTime<Utc>>, _>(4),
            config: SessionConfig {
                duration_per_project_min: r.get::<i64, _>(5),
                question_duration_min: r.get::<i64, _>(6),
                break_duration_min: r.get::<i64, _>(7),
                grading: parse_grading(&r.get::<String, _>(8)),
                allow_guest: r.get::<bool, _>(9),
                feedback_window: parse_window(&r.get::<String, _>(10)),
                max_comments_per_project: r.get::<i64, _>(11).max(0) as u32,
                feedback_visibility: FeedbackVisibility {
                    teacher: r.get::<bool, _>(12),
                    student: r.get::<bool, _>(13),
                    guest: r.get::<bool, _>(14),
                },
            },
        }))
    }

    /// Appends the project at the end of the topic's queue.
    pub async fn create_project(
        &self,
        topic_id: TopicId,
        title: &str,
        repo_url: Option<&str>,
        demo_url: Option<&str>,
        members: &[StoredMember],
    ) -> Result<ProjectId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO project_submissions (topic_id, title, queue_order, repo_url, demo_url)
             VALUES (
                ?1, ?2,
                COALESCE((SELECT MAX(queue_order) + 1 FROM project_submissions WHERE topic_id = ?1), 1),
                ?3, ?4
             )
             RETURNING id",
        )
        .bind(topic_id.0)
        .bind(title)
        .bind(repo_url)
        .bind(demo_url)
        .fetch_one(&mut *tx)
        .await?;
        let project_id = ProjectId(rec.get::<i64, _>(0));

        for member in members {
            sqlx::query(
                "INSERT INTO project_members (project_id, user_id, display_name, email, student_no)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(project_id.0)
            .bind(member.user_id.map(|id| id.0))
            .bind(member.display_name.as_str())
            .bind(member.email.as_deref())
            .bind(member.student_no.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(project_id)
    }

    pub async fn load_project(&self, project_id: ProjectId) -> Result<Option<StoredProject>> {
        let row = sqlx::query(
            "SELECT id, topic_id, title, queue_order, repo_url, demo_url
             FROM project_submissions WHERE id = ?",
        )
        .bind(project_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(project_from_row))
    }

    pub async fn list_projects(&self, topic_id: TopicId) -> Result<Vec<StoredProject>> {
        let rows = sqlx::query(
            "SELECT id, topic_id, title, queue_order, repo_url, demo_url
             FROM project_submissions
             WHERE topic_id = ?
             ORDER BY queue_order ASC",
        )
        .bind(topic_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(project_from_row).collect())
    }

    pub async fn members_for_project(&self, project_id: ProjectId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT user_id, display_name, email, student_no
             FROM project_members
             WHERE project_id = ?
             ORDER BY id ASC",
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: r.get::<Option<i64>, _>(0).map(UserId),
                display_name: r.get::<String, _>(1),
                email: r.get::<Option<String>, _>(2),
                student_no: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    pub async fn first_project(&self, topic_id: TopicId) -> Result<Option<ProjectId>> {
        let row = sqlx::query(
            "SELECT id FROM project_submissions
             WHERE topic_id = ?
             ORDER BY queue_order ASC
             LIMIT 1",
        )
        .bind(topic_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ProjectId(r.get::<i64, _>(0))))
    }

    /// Next project in queue order after the given one, if any.
    pub async fn next_project_after(
        &self,
        topic_id: TopicId,
        project_id: ProjectId,
    ) -> Result<Option<ProjectId>> {
        let row = sqlx::query(
            "SELECT id FROM project_submissions
             WHERE topic_id = ?1
               AND queue_order > (SELECT queue_order FROM project_submissions WHERE id = ?2)
             ORDER BY queue_order ASC
             LIMIT 1",
        )
        .bind(topic_id.0)
        .bind(project_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ProjectId(r.get::<i64, _>(0))))
    }

    pub async fn load_session(&self, topic_id: TopicId) -> Result<Option<ActiveSession>> {
        let row = sqlx::query(
            "SELECT status, phase, current_project_id, started_at, paused_at
             FROM active_sessions WHERE topic_id = ?",
        )
        .bind(topic_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ActiveSession {
            status: parse_status(&r.get::<String, _>(0)),
            phase: parse_phase(&r.get::<String, _>(1)),
            current_project_id: r.get::<Option<i64>, _>(2).map(ProjectId),
            started_at: r.get::<Option<DateTime<Utc>>, _>(3),
            paused_at: r.get::<Option<DateTime<Utc>>, _>(4),
        }))
    }

    /// Writes `next` only if the stored row still matches the state the
    /// transition was computed from. Returns false when a concurrent
    /// writer got there first; the caller surfaces that as a conflict.
    pub async fn commit_session_transition(
        &self,
        topic_id: TopicId,
        expected: &ActiveSession,
        next: &ActiveSession,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE active_sessions
             SET status = ?, phase = ?, current_project_id = ?, started_at = ?, paused_at = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE topic_id = ?
               AND status = ?
               AND phase = ?
               AND current_project_id IS ?",
        )
        .bind(status_str(next.status))
        .bind(phase_str(next.phase))
        .bind(next.current_project_id.map(|id| id.0))
        .bind(next.started_at)
        .bind(next.paused_at)
        .bind(topic_id.0)
        .bind(status_str(expected.status))
        .bind(phase_str(expected.phase))
        .bind(expected.current_project_id.map(|id| id.0))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Appends one feedback entry with its score tuples. The per-reviewer
    /// cap is checked inside the INSERT itself so two concurrent
    /// submissions cannot both pass a stale count; `None` means the cap
    /// was already reached.
    pub async fn insert_feedback(
        &self,
        topic_id: TopicId,
        project_id: ProjectId,
        reviewer: &Reviewer,
        reviewer_kind: ReviewerKind,
        feedback_kind: FeedbackKind,
        comment: Option<&str>,
        scores: &[StoredScore],
        max_per_project: u32,
    ) -> Result<Option<FeedbackId>> {
        let mut tx = self.pool.begin().await?;

        let row = match reviewer {
            Reviewer::Registered { user_id } => {
                sqlx::query(
                    "INSERT INTO feedback_entries
                        (topic_id, project_id, reviewer_user_id, reviewer_kind, feedback_kind, comment)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6
                     WHERE ?7 = 0 OR (
                        SELECT COUNT(*) FROM feedback_entries
                        WHERE project_id = ?2 AND reviewer_user_id = ?3
                     ) < ?7
                     RETURNING id",
                )
                .bind(topic_id.0)
                .bind(project_id.0)
                .bind(user_id.0)
                .bind(reviewer_kind_str(reviewer_kind))
                .bind(feedback_kind_str(feedback_kind))
                .bind(comment)
                .bind(max_per_project as i64)
                .fetch_optional(&mut *tx)
                .await?
            }
            Reviewer::Guest { guest_id, name } => {
                sqlx::query(
                    "INSERT INTO feedback_entries
                        (topic_id, project_id, guest_id, guest_name, reviewer_kind, feedback_kind, comment)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                     WHERE ?8 = 0 OR (
                        SELECT COUNT(*) FROM feedback_entries
                        WHERE project_id = ?2 AND guest_id = ?3
                     ) < ?8
                     RETURNING id",
                )
                .bind(topic_id.0)
                .bind(project_id.0)
                .bind(guest_id.to_string())
                .bind(name.as_str())
                .bind(reviewer_kind_str(reviewer_kind))
                .bind(feedback_kind_str(feedback_kind))
                .bind(comment)
                .bind(max_per_project as i64)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let feedback_id = FeedbackId(row.get::<i64, _>(0));

        for score in scores {
            sqlx::query(
                "INSERT INTO feedback_scores (entry_id, label, score, text_value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(feedback_id.0)
            .bind(score.label.as_str())
            .bind(score.score)
            .bind(score.text_value.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(feedback_id))
    }

    pub async fn list_feedback_for_project(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<StoredFeedback>> {
        let rows = sqlx::query(
            "SELECT id, topic_id, project_id, reviewer_user_id, guest_id, guest_name,
                    reviewer_kind, feedback_kind, comment, created_at
             FROM feedback_entries
             WHERE project_id = ?
             ORDER BY id ASC",
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for r in rows {
            let feedback_id = FeedbackId(r.get::<i64, _>(0));
            let reviewer = match r.get::<Option<i64>, _>(3) {
                Some(user_id) => Reviewer::Registered {
                    user_id: UserId(user_id),
                },
                None => Reviewer::Guest {
                    guest_id: r
                        .get::<Option<String>, _>(4)
                        .as_deref()
                        .and_then(|raw| Uuid::parse_str(raw).ok())
                        .unwrap_or_else(Uuid::nil),
                    name: r.get::<Option<String>, _>(5).unwrap_or_default(),
                },
            };
            let scores = self.scores_for_entry(feedback_id).await?;
            entries.push(StoredFeedback {
                feedback_id,
                topic_id: TopicId(r.get::<i64, _>(1)),
                project_id: ProjectId(r.get::<i64, _>(2)),
                reviewer,
                reviewer_kind: parse_reviewer_kind(&r.get::<String, _>(6)),
                feedback_kind: parse_feedback_kind(&r.get::<String, _>(7)),
                comment: r.get::<Option<String>, _>(8),
                scores,
                created_at: r.get::<DateTime<Utc>, _>(9),
            });
        }
        Ok(entries)
    }

    async fn scores_for_entry(&self, feedback_id: FeedbackId) -> Result<Vec<StoredScore>> {
        let rows = sqlx::query(
            "SELECT label, score, text_value FROM feedback_scores WHERE entry_id = ? ORDER BY id ASC",
        )
        .bind(feedback_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredScore {
                label: r.get::<String, _>(0),
                score: r.get::<Option<f64>, _>(1),
                text_value: r.get::<Option<String>, _>(2),
            })
            .collect())
    }

    pub async fn feedback_count_for_reviewer(
        &self,
        project_id: ProjectId,
        reviewer: &Reviewer,
    ) -> Result<i64> {
        let count = match reviewer {
            Reviewer::Registered { user_id } => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM feedback_entries
                     WHERE project_id = ? AND reviewer_user_id = ?",
                )
                .bind(project_id.0)
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await?
            }
            Reviewer::Guest { guest_id, .. } => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM feedback_entries
                     WHERE project_id = ? AND guest_id = ?",
                )
                .bind(project_id.0)
                .bind(guest_id.to_string())
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }

    /// Per-label mean/total over numeric scores. Zero entries yield zero
    /// rows rather than any division-by-zero path.
    pub async fn aggregate_scores(&self, project_id: ProjectId) -> Result<Vec<AggregatedScore>> {
        let rows = sqlx::query(
            "SELECT s.label, COUNT(s.score), AVG(s.score), SUM(s.score)
             FROM feedback_scores s
             INNER JOIN feedback_entries e ON e.id = s.entry_id
             WHERE e.project_id = ? AND s.score IS NOT NULL
             GROUP BY s.label
             ORDER BY s.label ASC",
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| AggregatedScore {
                label: r.get::<String, _>(0),
                samples: r.get::<i64, _>(1),
                mean: r.get::<f64, _>(2),
                total: r.get::<f64, _>(3),
            })
            .collect())
    }
}

fn project_from_row(r: sqlx::sqlite::SqliteRow) -> StoredProject {
    StoredProject {
        project_id: ProjectId(r.get::<i64, _>(0)),
        topic_id: TopicId(r.get::<i64, _>(1)),
        title: r.get::<String, _>(2),
        queue_order: r.get::<i64, _>(3),
        repo_url: r.get::<Option<String>, _>(4),
        demo_url: r.get::<Option<String>, _>(5),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Teacher => "teacher",
        Role::Student => "student",
    }
}

fn parse_role(raw: &str) -> Role {
    match raw {
        "teacher" => Role::Teacher,
        _ => Role::Student,
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Idle => "idle",
        SessionStatus::Active => "active",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
    }
}

fn parse_status(raw: &str) -> SessionStatus {
    match raw {
        "active" => SessionStatus::Active,
        "paused" => SessionStatus::Paused,
        "completed" => SessionStatus::Completed,
        _ => SessionStatus::Idle,
    }
}

fn phase_str(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Presentation => "presentation",
        SessionPhase::Qa => "qa",
        SessionPhase::Break => "break",
    }
}

fn parse_phase(raw: &str) -> SessionPhase {
    match raw {
        "qa" => SessionPhase::Qa,
        "break" => SessionPhase::Break,
        _ => SessionPhase::Presentation,
    }
}

fn grading_str(grading: GradingKind) -> &'static str {
    match grading {
        GradingKind::Rubric => "rubric",
        GradingKind::Survey => "survey",
        GradingKind::Comments => "comments",
    }
}

fn parse_grading(raw: &str) -> GradingKind {
    match raw {
        "survey" => GradingKind::Survey,
        "comments" => GradingKind::Comments,
        _ => GradingKind::Rubric,
    }
}

fn window_str(window: FeedbackWindow) -> &'static str {
    match window {
        FeedbackWindow::AnyPhase => "any_phase",
        FeedbackWindow::QaOnly => "qa_only",
    }
}

fn parse_window(raw: &str) -> FeedbackWindow {
    match raw {
        "qa_only" => FeedbackWindow::QaOnly,
        _ => FeedbackWindow::AnyPhase,
    }
}

fn reviewer_kind_str(kind: ReviewerKind) -> &'static str {
    match kind {
        ReviewerKind::Teacher => "teacher",
        ReviewerKind::Student => "student",
        ReviewerKind::Guest => "guest",
    }
}

fn parse_reviewer_kind(raw: &str) -> ReviewerKind {
    match raw {
        "teacher" => ReviewerKind::Teacher,
        "student" => ReviewerKind::Student,
        _ => ReviewerKind::Guest,
    }
}

fn feedback_kind_str(kind: FeedbackKind) -> &'static str {
    match kind {
        FeedbackKind::Comment => "comment",
        FeedbackKind::Question => "question",
    }
}

fn parse_feedback_kind(raw: &str) -> FeedbackKind {
    match raw {
        "question" => FeedbackKind::Question,
        _ => FeedbackKind::Comment,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
