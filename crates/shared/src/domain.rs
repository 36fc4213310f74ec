use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(TopicId);
id_newtype!(ProjectId);
id_newtype!(FeedbackId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Presentation,
    Qa,
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingKind {
    Rubric,
    Survey,
    Comments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerKind {
    Teacher,
    Student,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Comment,
    Question,
}

/// When a topic accepts incoming feedback during a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackWindow {
    AnyPhase,
    QaOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackVisibility {
    #[serde(default = "default_true")]
    pub teacher: bool,
    #[serde(default)]
    pub student: bool,
    #[serde(default)]
    pub guest: bool,
}

impl Default for FeedbackVisibility {
    fn default() -> Self {
        Self {
            teacher: true,
            student: false,
            guest: false,
        }
    }
}

/// Per-topic presentation settings. Durations are minutes; the phase timer
/// converts to milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_presentation_min")]
    pub duration_per_project_min: i64,
    #[serde(default = "default_question_min")]
    pub question_duration_min: i64,
    #[serde(default = "default_break_min")]
    pub break_duration_min: i64,
    #[serde(default = "default_grading")]
    pub grading: GradingKind,
    #[serde(default)]
    pub allow_guest: bool,
    #[serde(default = "default_feedback_window")]
    pub feedback_window: FeedbackWindow,
    /// Per-reviewer comment cap per project. 0 means unlimited.
    #[serde(default)]
    pub max_comments_per_project: u32,
    #[serde(default)]
    pub feedback_visibility: FeedbackVisibility,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_per_project_min: default_presentation_min(),
            question_duration_min: default_question_min(),
            break_duration_min: default_break_min(),
            grading: default_grading(),
            allow_guest: false,
            feedback_window: default_feedback_window(),
            max_comments_per_project: 0,
            feedback_visibility: FeedbackVisibility::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_presentation_min() -> i64 {
    10
}

fn default_question_min() -> i64 {
    5
}

fn default_break_min() -> i64 {
    2
}

fn default_grading() -> GradingKind {
    GradingKind::Rubric
}

fn default_feedback_window() -> FeedbackWindow {
    FeedbackWindow::AnyPhase
}

/// Who authored a feedback entry. Guests carry their own stable id plus a
/// display-name snapshot taken at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reviewer {
    Registered { user_id: UserId },
    Guest { guest_id: Uuid, name: String },
}

/// The resolved identity of a request, as handed over by the auth boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Registered { user_id: UserId, role: Role },
    Guest,
}
