mod support;

use futures::future::join_all;
use libris_core::api::{ApiError, ApiRequest, ApiResponse};
use libris_core::auth::SessionState;
use pretty_assertions::assert_eq;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;

use support::{harness, settle, FakeBackend};

const CONCURRENT: usize = 5;

fn book(n: usize) -> ApiRequest {
    ApiRequest::get(format!("/books/{}/", n))
}

#[tokio::test]
async fn authorized_client_attaches_bearer() {
    let h = harness(FakeBackend::accepting("T1"), Some("T1"));

    let response = h.client.send(book(1)).await.expect("accepted");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.backend.sent_with("T1"), 1);
    assert_eq!(h.backend.refreshes(), 0);
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let h = harness(FakeBackend::accepting("T2").issuing("T2").held(), Some("T1"));
    let backend = h.backend.clone();

    let requests = join_all((0..CONCURRENT).map(|n| h.client.send(book(n))));
    let (results, _) = tokio::join!(requests, async {
        settle(|| backend.rejected() == CONCURRENT).await;
        backend.release();
    });

    for result in results {
        assert_eq!(result.expect("retried").status, StatusCode::OK);
    }
    assert_eq!(h.backend.refreshes(), 1);
    assert_eq!(h.backend.sent_with("T1"), CONCURRENT);
    assert_eq!(h.backend.sent_with("T2"), CONCURRENT);
    assert_eq!(h.store.access_token().as_deref(), Some("T2"));
    assert_eq!(h.store.get().and_then(|c| c.refresh).as_deref(), Some("R1"));
    assert_eq!(h.session.state(), SessionState::LoggedIn);
    assert_eq!(h.guard.fired(), 0);
}

#[tokio::test]
async fn failed_refresh_fails_every_waiter_and_expires_once() {
    let h = harness(FakeBackend::accepting("T2").held(), Some("T1"));
    let backend = h.backend.clone();
    let mut states = h.session.subscribe();

    let requests = join_all((0..CONCURRENT).map(|n| h.client.send(book(n))));
    let (results, _) = tokio::join!(requests, async {
        settle(|| backend.rejected() == CONCURRENT).await;
        backend.release();
    });

    for result in results {
        assert_eq!(result.unwrap_err(), ApiError::SessionExpired);
    }
    assert_eq!(h.backend.refreshes(), 1);
    assert_eq!(h.backend.sent_with("T2"), 0);
    assert!(h.store.get().is_none());
    assert_eq!(h.session.state(), SessionState::LoggedOut);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SessionState::LoggedOut);
    assert_eq!(h.guard.fired(), 1);
}

#[tokio::test]
async fn second_rejection_after_retry_expires_session() {
    let h = harness(FakeBackend::accepting("T9").issuing_useless("T2"), Some("T1"));

    let result = h.client.send(book(1)).await;

    assert_eq!(result.unwrap_err(), ApiError::SessionExpired);
    assert_eq!(h.backend.refreshes(), 1);
    assert_eq!(h.backend.sent_with("T1"), 1);
    assert_eq!(h.backend.sent_with("T2"), 1);
    assert_eq!(h.session.state(), SessionState::LoggedOut);
    assert_eq!(h.guard.fired(), 1);
}

#[tokio::test]
async fn refresh_endpoint_rejection_is_not_retried() {
    let h = harness(FakeBackend::accepting("T1"), Some("T1"));

    let response = h
        .client
        .execute(ApiRequest::post("/accounts/token/refresh/"))
        .await
        .expect("raw outcome");

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.backend.refreshes(), 1);
    assert_eq!(h.session.state(), SessionState::LoggedIn);
    assert_eq!(h.guard.fired(), 0);
}

#[tokio::test]
async fn request_carrying_stale_credential_retries_without_refresh() {
    let h = harness(FakeBackend::accepting("T2"), Some("T2"));
    let stale = book(1).header(header::AUTHORIZATION, HeaderValue::from_static("Bearer T1"));

    let response = h
        .session
        .handle_response(
            &h.client,
            stale,
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "")),
        )
        .await
        .expect("retried");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.backend.refreshes(), 0);
    assert_eq!(h.backend.sent_with("T2"), 1);
}

#[tokio::test]
async fn non_auth_failures_pass_through_untouched() {
    let h = harness(FakeBackend::accepting("T1"), Some("T1"));

    let outcome = h
        .session
        .handle_response(
            &h.client,
            book(1),
            Ok(ApiResponse::new(StatusCode::FORBIDDEN, "nope")),
        )
        .await
        .expect("passed through");
    assert_eq!(outcome.status, StatusCode::FORBIDDEN);

    let failed = h
        .session
        .handle_response(&h.client, book(1), Err(ApiError::Network("reset".to_string())))
        .await;
    assert_eq!(failed.unwrap_err(), ApiError::Network("reset".to_string()));
    assert_eq!(h.backend.refreshes(), 0);
}

#[tokio::test]
async fn logout_during_refresh_does_not_resurrect_session() {
    let h = harness(FakeBackend::accepting("T2").issuing("T2").held(), Some("T1"));
    let backend = h.backend.clone();
    let session = h.session.clone();

    let (result, _) = tokio::join!(h.client.send(book(1)), async {
        settle(|| backend.refreshes() == 1).await;
        session.logout().await;
        backend.release();
    });

    assert_eq!(result.unwrap_err(), ApiError::SessionExpired);
    assert!(h.store.get().is_none());
    assert_eq!(h.session.state(), SessionState::LoggedOut);
    assert_eq!(h.backend.sent_with("T2"), 0);
    assert_eq!(h.guard.fired(), 0);
}

#[tokio::test]
async fn dropped_leader_releases_waiting_requests() {
    let h = harness(FakeBackend::accepting("T2").issuing("T2").held(), Some("T1"));
    let backend = h.backend.clone();

    let mut leader = Box::pin(h.client.send(book(1)));
    assert!(futures::poll!(leader.as_mut()).is_pending());
    assert_eq!(h.backend.refreshes(), 1);

    let (follower, _) = tokio::join!(h.client.send(book(2)), async move {
        settle(|| backend.rejected() == 2).await;
        drop(leader);
    });

    assert!(matches!(follower, Err(ApiError::Network(_))));
    assert_eq!(h.session.state(), SessionState::LoggedIn);
    assert_eq!(h.guard.fired(), 0);
}

#[tokio::test]
async fn request_after_logout_is_not_refreshed() {
    let h = harness(FakeBackend::accepting("T1").issuing("T2"), Some("T1"));
    h.session.logout().await;

    let result = h.client.send(book(1)).await;

    assert_eq!(result.unwrap_err(), ApiError::Unauthorized);
    assert_eq!(h.backend.refreshes(), 0);
    assert!(h.store.get().is_none());
    assert_eq!(h.session.state(), SessionState::LoggedOut);
    assert_eq!(h.guard.fired(), 0);
}

#[tokio::test]
async fn unauthenticated_request_gets_plain_rejection() {
    let h = harness(FakeBackend::accepting("T1").issuing("T2"), None);

    let response = h.client.execute(book(1)).await.expect("raw outcome");

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.backend.refreshes(), 0);
    assert!(h.store.get().is_none());
    assert_eq!(h.session.state(), SessionState::LoggedOut);
}
