mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};

use cadence_api::models::PersonalityProfile;

use common::{config, profile_created_days_ago, spawn_app};

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app(config(&[]));
    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = spawn_app(config(&[]));
    let id = "4b0f2f6a-8d7e-4c2b-9a55-3f1f4cba2e10";
    let response = app
        .server
        .get("/health")
        .add_header(
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderValue::from_static(id),
        )
        .await;
    assert_eq!(response.header("x-request-id"), id);
}

#[tokio::test]
async fn test_recommendations_default_size_and_metadata() {
    let app = spawn_app(config(&[]));
    let response = app.server.get("/api/v1/users/u1/recommendations").await;
    response.assert_status_ok();

    let body: Value = response.json();
    let recs = body["recommendations"].as_array().unwrap();
    assert_eq!(recs.len(), 50);
    assert_eq!(body["metadata"]["cache_hit"], false);
    assert_eq!(body["metadata"]["stage"], "month_2_plus");
    assert!(body["metadata"]["candidate_count"].as_u64().unwrap() >= 50);
    assert!(body["metadata"]["weights"]["history"].is_number());

    let scores: Vec<f64> = recs
        .iter()
        .map(|r| r["scores"]["final_score"].as_f64().unwrap())
        .collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    let app = spawn_app(config(&[]));
    app.server
        .get("/api/v1/users/u1/recommendations")
        .add_query_param("max_results", 20)
        .await
        .assert_status_ok();

    let mut hit = false;
    for _ in 0..50 {
        let body: Value = app
            .server
            .get("/api/v1/users/u1/recommendations")
            .add_query_param("max_results", 10)
            .await
            .json();
        if body["metadata"]["cache_hit"] == true {
            assert_eq!(body["recommendations"].as_array().unwrap().len(), 10);
            hit = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hit);

    let body: Value = app
        .server
        .get("/api/v1/users/u1/recommendations")
        .add_query_param("max_results", 10)
        .add_query_param("force_refresh", true)
        .await
        .json();
    assert_eq!(body["metadata"]["cache_hit"], false);
}

#[tokio::test]
async fn test_max_results_out_of_range_is_rejected() {
    let app = spawn_app(config(&[]));
    for bad in [0, 101] {
        let response = app
            .server
            .get("/api/v1/users/u1/recommendations")
            .add_query_param("max_results", bad)
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert!(body["error"].as_str().unwrap().contains("max_results"));
    }
}

#[tokio::test]
async fn test_new_account_is_in_week_one() {
    let app = spawn_app(config(&[]));
    app.profiles
        .upsert("new-user", profile_created_days_ago(2, PersonalityProfile::default()))
        .unwrap();

    let body: Value = app
        .server
        .get("/api/v1/users/new-user/recommendations")
        .await
        .json();
    assert_eq!(body["metadata"]["stage"], "week_1");
    assert_eq!(body["metadata"]["account_age_days"], 2);
}

#[tokio::test]
async fn test_feedback_reaches_learning_stats() {
    let app = spawn_app(config(&[]));
    let body: Value = app
        .server
        .get("/api/v1/users/u1/recommendations")
        .add_query_param("max_results", 5)
        .await
        .json();
    let track_id = body["recommendations"][0]["track"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .server
        .post("/api/v1/users/u1/feedback")
        .json(&json!({
            "track_id": track_id,
            "feedback_type": "like",
            "context": { "listen_duration_secs": 190.0, "track_duration_secs": 200.0 }
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let ack: Value = response.json();
    assert_eq!(ack["acknowledged"], true);

    let mut stats = Value::Null;
    for _ in 0..50 {
        stats = app.server.get("/api/v1/users/u1/learning-stats").await.json();
        if stats["episodes"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats["episodes"], 1);
    assert!((stats["total_reward"].as_f64().unwrap() - 1.4).abs() < 1e-9);
    assert_eq!(stats["q_table_size"], 1);
    assert!(stats["best_genres"].as_array().unwrap().len() == 1);
}

#[tokio::test]
async fn test_feedback_validation() {
    let app = spawn_app(config(&[]));

    let response = app
        .server
        .post("/api/v1/users/u1/feedback")
        .json(&json!({ "track_id": "  ", "feedback_type": "like" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = app
        .server
        .post("/api/v1/users/u1/feedback")
        .json(&json!({ "track_id": "t1", "feedback_type": "love" }))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_stats_endpoints() {
    let app = spawn_app(config(&[]));
    app.server
        .get("/api/v1/users/u1/recommendations")
        .await
        .assert_status_ok();

    let limits: Value = app.server.get("/api/v1/stats/rate-limits").await.json();
    assert_eq!(limits["global"]["name"], "global");
    assert_eq!(limits["endpoints"].as_array().unwrap().len(), 7);
    assert_eq!(limits["daily_quota"]["budget"], 100_000);

    let cache: Value = app.server.get("/api/v1/stats/cache").await.json();
    assert_eq!(cache["backend"], "memory");
    assert!(cache["misses"].as_u64().unwrap() > 0);

    let usage: Value = app.server.get("/api/v1/users/u1/rate-limit").await.json();
    assert_eq!(usage["user_id"], "u1");
    assert_eq!(usage["limit"], 100);
    assert!(usage["current"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_user_rate_limit_returns_429() {
    let app = spawn_app(config(&[("USER_REQUESTS_PER_MINUTE", "3")]));

    for _ in 0..3 {
        let response = app
            .server
            .get("/api/v1/stats/cache")
            .add_header(
                axum::http::HeaderName::from_static("x-user-id"),
                axum::http::HeaderValue::from_static("busy"),
            )
            .await;
        response.assert_status_ok();
    }

    let response = app
        .server
        .get("/api/v1/stats/cache")
        .add_header(
            axum::http::HeaderName::from_static("x-user-id"),
            axum::http::HeaderValue::from_static("busy"),
        )
        .await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.header("x-ratelimit-remaining"), "0");
    assert!(response.headers().get("retry-after").is_some());

    app.server
        .get("/api/v1/stats/cache")
        .add_header(
            axum::http::HeaderName::from_static("x-user-id"),
            axum::http::HeaderValue::from_static("calm"),
        )
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_graceful_shutdown_drains_feedback() {
    let app = spawn_app(config(&[]));
    let body: Value = app
        .server
        .get("/api/v1/users/u1/recommendations")
        .add_query_param("max_results", 3)
        .await
        .json();
    let track_id = body["recommendations"][0]["track"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    for _ in 0..3 {
        app.server
            .post("/api/v1/users/u1/feedback")
            .json(&json!({ "track_id": track_id, "feedback_type": "play" }))
            .await
            .assert_status(StatusCode::ACCEPTED);
    }

    let learning = app.state.learning.clone();
    app.background.shutdown().await;
    assert_eq!(learning.stats("u1").await.episodes, 3);
}
