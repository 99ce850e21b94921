//! Postgres store checks. Skipped unless `DATABASE_URL` points at a scratch database.

use chrono::{TimeZone, Utc};
use sqlx::{Executor, PgPool, postgres::PgPoolOptions};

use selflearn_worker::store::dao::{FeedbackSource, PgFeedbackSource, PgReportStore, ReportStore};
use selflearn_worker::store::models::{
    Feedback, NewCluster, Page, QuestionType, ReportFilter, ReportKey, ReportStatus, TimeWindow,
};

async fn setup_test_database() -> Option<PgPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping postgres store test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .expect("database connection");
    pool.execute(include_str!("../migrations/0001_selflearn.sql"))
        .await
        .expect("run migration");
    Some(pool)
}

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("start"),
        Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).single().expect("end"),
    )
    .expect("window")
}

#[tokio::test]
async fn report_lifecycle_round_trips_through_postgres() {
    let Some(pool) = setup_test_database().await else {
        return;
    };
    // Unique per run so reruns against the same database do not collide.
    let tenant = format!("pg-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let store = PgReportStore::new(pool.clone());
    store.ping().await.expect("ping");

    let key = ReportKey {
        tenant_id: tenant.clone(),
        question_type: QuestionType::Unsolved,
        window: window(),
    };
    let first = store.create_or_get(&key).await.expect("create");
    let second = store.create_or_get(&key).await.expect("dedup");
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.report.id, second.report.id);
    assert_eq!(first.report.status, ReportStatus::Running);

    let at = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).single().expect("at");
    let members: Vec<Feedback> = (1..=3)
        .map(|id| Feedback {
            id,
            text: format!("question {id}"),
            timestamp: at,
        })
        .collect();
    let clusters = vec![NewCluster {
        members,
        tags: vec!["question".to_string()],
    }];
    assert!(store.complete_report(first.report.id, &clusters).await.expect("complete"));
    assert!(!store.complete_report(first.report.id, &clusters).await.expect("second complete"));
    assert!(!store.fail_report(first.report.id, "late").await.expect("late fail"));

    let report = store
        .get_report(first.report.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(report.status, ReportStatus::Finished);
    assert!(report.finished_at.is_some());

    let persisted = store.list_clusters(report.id).await.expect("clusters");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].member_feedback_ids, vec![1, 2, 3]);
    assert_eq!(persisted[0].representative_feedback_id, Some(1));
    assert_eq!(persisted[0].tags, vec!["question".to_string()]);

    let page = store
        .list_cluster_members(report.id, persisted[0].id, Page { number: 2, size: 2 })
        .await
        .expect("members")
        .expect("cluster belongs to report");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].feedback_id, 3);

    let listed = store
        .list_reports(&ReportFilter {
            tenant_id: Some(tenant.clone()),
            question_type: Some(QuestionType::Unsolved),
            limit: 10,
        })
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);

    assert!(store.delete_report(report.id).await.expect("delete"));
    assert!(!store.delete_report(report.id).await.expect("second delete"));
    assert!(store.list_clusters(report.id).await.expect("clusters").is_empty());
}

#[tokio::test]
async fn feedback_source_dedups_question_text() {
    let Some(pool) = setup_test_database().await else {
        return;
    };
    let tenant = format!("pg-feedback-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    for (question, day) in [("where is my parcel", 2), ("where is my parcel", 3), ("reset password", 4)] {
        sqlx::query(
            "INSERT INTO user_feedback (tenant_id, question_type, question, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&tenant)
        .bind(QuestionType::Dissatisfied.code())
        .bind(question)
        .bind(Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).single().expect("at"))
        .execute(&pool)
        .await
        .expect("insert feedback");
    }

    let source = PgFeedbackSource::new(pool);
    let feedback = source
        .fetch_window(&tenant, QuestionType::Dissatisfied, &window(), 100)
        .await
        .expect("fetch");
    let texts: Vec<&str> = feedback.iter().map(|item| item.text.as_str()).collect();
    assert_eq!(texts, vec!["where is my parcel", "reset password"]);

    let capped = source
        .fetch_window(&tenant, QuestionType::Dissatisfied, &window(), 1)
        .await
        .expect("fetch");
    assert_eq!(capped.len(), 1);

    let other_type = source
        .fetch_window(&tenant, QuestionType::Unsolved, &window(), 100)
        .await
        .expect("fetch");
    assert!(other_type.is_empty());
}

#[tokio::test]
async fn create_or_get_survives_concurrent_deletes() {
    let Some(pool) = setup_test_database().await else {
        return;
    };
    let tenant = format!("pg-churn-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let store = std::sync::Arc::new(PgReportStore::new(pool));
    let key = ReportKey {
        tenant_id: tenant,
        question_type: QuestionType::Unsolved,
        window: window(),
    };

    let first = store.create_or_get(&key).await.expect("create");
    assert!(store.delete_report(first.report.id).await.expect("delete"));
    let recreated = store.create_or_get(&key).await.expect("recreate");
    assert!(recreated.created);
    assert_ne!(recreated.report.id, first.report.id);

    let deleter = {
        let store = std::sync::Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let outcome = store.create_or_get(&key).await.expect("create during churn");
                store.delete_report(outcome.report.id).await.expect("delete");
            }
        })
    };
    for _ in 0..50 {
        let outcome = store.create_or_get(&key).await.expect("create during churn");
        assert_eq!(outcome.report.key(), key);
    }
    deleter.await.expect("deleter task");
}
