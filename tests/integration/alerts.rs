//! Webhook delivery of evaluation notifications

use fleetwatch::{
    NodeRef, ResultValue,
    alerts::AlertManager,
    config::{Alert, Webhook},
    evaluation::ResultEvaluation,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn manager(server: &MockServer) -> AlertManager {
    AlertManager::new(
        Some(Alert::Webhook(Webhook {
            url: format!("{}/hook", server.uri()),
        })),
        NodeRef::aggregator("agg-east"),
    )
}

#[tokio::test]
async fn test_streak_start_and_recovery_are_posted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let alerts = manager(&server);
    let value = ResultValue::Int(97);
    alerts
        .send_evaluation_alert(ResultEvaluation::StartsToFail, 5, &value)
        .await;
    alerts
        .send_evaluation_alert(ResultEvaluation::Failing, 5, &value)
        .await;
    alerts
        .send_evaluation_alert(ResultEvaluation::BackToOk, 5, &ResultValue::Int(3))
        .await;

    let requests = server.received_requests().await.unwrap();
    let bodies: Vec<serde_json::Value> = requests
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(
        bodies[0]["message"],
        "Job 5 has caused an error! The value 97 failed an evaluation."
    );
    assert_eq!(bodies[0]["aggregator"], "agg-east");
    assert_eq!(bodies[1]["message"], "Job 5 is back within normal parameters");
}

#[tokio::test]
async fn test_passing_results_post_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    manager(&server)
        .send_evaluation_alert(ResultEvaluation::Ok, 1, &ResultValue::Float(0.2))
        .await;
}

#[tokio::test]
async fn test_webhook_errors_are_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    manager(&server)
        .send_evaluation_alert(ResultEvaluation::StartsToFail, 2, &ResultValue::Text("down".into()))
        .await;
}
