use super::*;
use chrono::Utc;

async fn topic_fixture(storage: &Storage, config: SessionConfig) -> (UserId, TopicId) {
    let teacher = storage
        .create_user("ms-given", Role::Teacher)
        .await
        .expect("teacher");
    let topic = storage
        .create_topic(teacher, "Systems Projects", &config, None, None)
        .await
        .expect("topic");
    (teacher, topic)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("presenter_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn new_topic_starts_with_an_idle_session_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;

    let session = storage
        .load_session(topic)
        .await
        .expect("load session")
        .expect("session row exists");
    assert_eq!(session, ActiveSession::idle());
}

#[tokio::test]
async fn topic_config_round_trips() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let config = SessionConfig {
        duration_per_project_min: 7,
        question_duration_min: 3,
        break_duration_min: 1,
        grading: GradingKind::Survey,
        allow_guest: true,
        feedback_window: FeedbackWindow::QaOnly,
        max_comments_per_project: 4,
        feedback_visibility: FeedbackVisibility {
            teacher: true,
            student: true,
            guest: false,
        },
    };
    let (teacher, topic) = topic_fixture(&storage, config.clone()).await;

    let stored = storage
        .load_topic(topic)
        .await
        .expect("load topic")
        .expect("topic exists");
    assert_eq!(stored.owner_user_id, teacher);
    assert_eq!(stored.title, "Systems Projects");
    assert_eq!(stored.config, config);
}

#[tokio::test]
async fn queue_order_steps_through_projects_in_submission_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;

    let p1 = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("p1");
    let p2 = storage
        .create_project(topic, "team two", None, None, &[])
        .await
        .expect("p2");
    let p3 = storage
        .create_project(topic, "team three", None, None, &[])
        .await
        .expect("p3");

    assert_eq!(storage.first_project(topic).await.expect("first"), Some(p1));
    assert_eq!(
        storage.next_project_after(topic, p1).await.expect("after p1"),
        Some(p2)
    );
    assert_eq!(
        storage.next_project_after(topic, p2).await.expect("after p2"),
        Some(p3)
    );
    assert_eq!(
        storage.next_project_after(topic, p3).await.expect("after p3"),
        None
    );
}

#[tokio::test]
async fn project_members_round_trip() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let student = storage
        .create_user("pat", Role::Student)
        .await
        .expect("student");

    let project = storage
        .create_project(
            topic,
            "team one",
            Some("https://example.org/repo"),
            None,
            &[
                StoredMember {
                    user_id: Some(student),
                    display_name: "Pat".into(),
                    email: None,
                    student_no: None,
                },
                StoredMember {
                    user_id: None,
                    display_name: "Visiting Vi".into(),
                    email: Some("vi@example.org".into()),
                    student_no: Some("X-17".into()),
                },
            ],
        )
        .await
        .expect("project");

    let members = storage
        .members_for_project(project)
        .await
        .expect("members");
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].user_id, Some(student));
    assert_eq!(members[1].display_name, "Visiting Vi");
    assert_eq!(members[1].student_no.as_deref(), Some("X-17"));
}

#[tokio::test]
async fn committed_transition_is_visible_on_reload() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    let idle = storage
        .load_session(topic)
        .await
        .expect("load")
        .expect("row");
    let started = idle.start(project, Utc::now()).expect("start");
    assert!(storage
        .commit_session_transition(topic, &idle, &started)
        .await
        .expect("commit"));

    let reloaded = storage
        .load_session(topic)
        .await
        .expect("load")
        .expect("row");
    assert_eq!(reloaded.status, SessionStatus::Active);
    assert_eq!(reloaded.current_project_id, Some(project));
    assert!(reloaded.started_at.is_some());
}

#[tokio::test]
async fn concurrent_advances_commit_exactly_once() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    let idle = storage
        .load_session(topic)
        .await
        .expect("load")
        .expect("row");
    let started = idle.start(project, Utc::now()).expect("start");
    assert!(storage
        .commit_session_transition(topic, &idle, &started)
        .await
        .expect("commit start"));

    // Both callers computed the same qa transition from the same snapshot.
    let to_qa = started.advance(None, Utc::now()).expect("advance");
    let storage_a = storage.clone();
    let storage_b = storage.clone();
    let (expected_a, next_a) = (started.clone(), to_qa.clone());
    let (expected_b, next_b) = (started.clone(), to_qa.clone());
    let (left, right) = tokio::join!(
        async move {
            storage_a
                .commit_session_transition(topic, &expected_a, &next_a)
                .await
                .expect("left commit")
        },
        async move {
            storage_b
                .commit_session_transition(topic, &expected_b, &next_b)
                .await
                .expect("right commit")
        }
    );

    assert_eq!(
        [left, right].into_iter().filter(|won| *won).count(),
        1,
        "exactly one advance should win"
    );
}

#[tokio::test]
async fn feedback_cap_rejects_only_the_excess_entry() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    let guest = Reviewer::Guest {
        guest_id: uuid::Uuid::new_v4(),
        name: "Visiting Vi".into(),
    };

    for n in 0..2 {
        let inserted = storage
            .insert_feedback(
                topic,
                project,
                &guest,
                ReviewerKind::Guest,
                FeedbackKind::Comment,
                Some(&format!("comment {n}")),
                &[],
                2,
            )
            .await
            .expect("insert");
        assert!(inserted.is_some(), "entry {n} should be admitted");
    }

    let rejected = storage
        .insert_feedback(
            topic,
            project,
            &guest,
            ReviewerKind::Guest,
            FeedbackKind::Comment,
            Some("one too many"),
            &[],
            2,
        )
        .await
        .expect("insert");
    assert!(rejected.is_none());
    assert_eq!(
        storage
            .feedback_count_for_reviewer(project, &guest)
            .await
            .expect("count"),
        2
    );

    // A different guest is unaffected by the first guest's cap.
    let other = Reviewer::Guest {
        guest_id: uuid::Uuid::new_v4(),
        name: "Other".into(),
    };
    let inserted = storage
        .insert_feedback(
            topic,
            project,
            &other,
            ReviewerKind::Guest,
            FeedbackKind::Comment,
            Some("fresh reviewer"),
            &[],
            2,
        )
        .await
        .expect("insert");
    assert!(inserted.is_some());
}

#[tokio::test]
async fn zero_cap_means_unlimited() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (teacher, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");
    let reviewer = Reviewer::Registered { user_id: teacher };

    for n in 0..5 {
        let inserted = storage
            .insert_feedback(
                topic,
                project,
                &reviewer,
                ReviewerKind::Teacher,
                FeedbackKind::Comment,
                Some(&format!("note {n}")),
                &[],
                0,
            )
            .await
            .expect("insert");
        assert!(inserted.is_some());
    }
}

#[tokio::test]
async fn listed_feedback_carries_scores_and_reviewer_identity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (teacher, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    let guest_id = uuid::Uuid::new_v4();
    storage
        .insert_feedback(
            topic,
            project,
            &Reviewer::Guest {
                guest_id,
                name: "Visiting Vi".into(),
            },
            ReviewerKind::Guest,
            FeedbackKind::Question,
            Some("how does the cache invalidate?"),
            &[StoredScore {
                label: "clarity".into(),
                score: Some(4.0),
                text_value: None,
            }],
            0,
        )
        .await
        .expect("guest entry");
    storage
        .insert_feedback(
            topic,
            project,
            &Reviewer::Registered { user_id: teacher },
            ReviewerKind::Teacher,
            FeedbackKind::Comment,
            None,
            &[
                StoredScore {
                    label: "clarity".into(),
                    score: Some(5.0),
                    text_value: None,
                },
                StoredScore {
                    label: "favorite part".into(),
                    score: None,
                    text_value: Some("the demo".into()),
                },
            ],
            0,
        )
        .await
        .expect("teacher entry");

    let entries = storage
        .list_feedback_for_project(project)
        .await
        .expect("list");
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[0].reviewer,
        Reviewer::Guest {
            guest_id,
            name: "Visiting Vi".into()
        }
    );
    assert_eq!(entries[0].feedback_kind, FeedbackKind::Question);
    assert_eq!(entries[1].scores.len(), 2);
    assert_eq!(entries[1].scores[1].text_value.as_deref(), Some("the demo"));
}

#[tokio::test]
async fn aggregation_over_zero_entries_returns_no_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (_, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    let aggregates = storage.aggregate_scores(project).await.expect("aggregate");
    assert!(aggregates.is_empty());
}

#[tokio::test]
async fn aggregation_computes_per_label_mean_and_total() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (teacher, topic) = topic_fixture(&storage, SessionConfig::default()).await;
    let project = storage
        .create_project(topic, "team one", None, None, &[])
        .await
        .expect("project");

    for score in [3.0, 5.0] {
        storage
            .insert_feedback(
                topic,
                project,
                &Reviewer::Registered { user_id: teacher },
                ReviewerKind::Teacher,
                FeedbackKind::Comment,
                None,
                &[
                    StoredScore {
                        label: "clarity".into(),
                        score: Some(score),
                        text_value: None,
                    },
                    // Text-only answers must not leak into numeric aggregates.
                    StoredScore {
                        label: "notes".into(),
                        score: None,
                        text_value: Some("fine".into()),
                    },
                ],
                0,
            )
            .await
            .expect("entry");
    }

    let aggregates = storage.aggregate_scores(project).await.expect("aggregate");
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].label, "clarity");
    assert_eq!(aggregates[0].samples, 2);
    assert_eq!(aggregates[0].mean, 4.0);
    assert_eq!(aggregates[0].total, 8.0);
}
