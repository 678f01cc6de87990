//! HTTP Router

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/token", post(token))
        .route("/schedule", get(schedule))
        .route("/manage-schedule", get(manage_schedule_page).post(update_schedule))
        .route("/status", get(status))
        .route("/config", get(config))
        .route("/bacnet/who-is/:device_instance", get(who_is))
        .route(
            "/bacnet/devices/:device_instance/:object_identifier",
            get(read_present_value),
        )
        .route(
            "/bacnet/devices/:device_instance/:object_identifier/:property",
            get(read_property).post(write_property),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use bas_runtime::service::ServiceManager;
    use chrono::NaiveDate;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::bacnet::{BacnetClient, DeviceCache};
    use crate::config::AppConfig;
    use crate::device::tests::identity;
    use crate::device::{BinaryPv, DeviceModel, DeviceWriter};
    use crate::occupancy::ManualClock;
    use crate::schedule::ScheduleStore;
    use crate::weather::Temperature;

    struct Harness {
        _dir: TempDir,
        state: AppState,
        writer: DeviceWriter,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScheduleStore::open(dir.path().join("schedule.json")).await);
        let (writer, view) = DeviceModel::new(identity(), -555.5);
        // No worker behind this client
        let (tx, _) = mpsc::channel(1);
        let client = BacnetClient::new(tx, DeviceCache::default(), Duration::from_millis(10));
        // Wednesday mid-morning
        let now = NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let state = AppState::new(
            store,
            view,
            client,
            Arc::new(ServiceManager::new()),
            Arc::new(ManualClock::new(now)),
            AppConfig::default(),
        );
        Harness {
            _dir: dir,
            state,
            writer,
        }
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        create_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn form(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn authed_get(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn bearer(state: &AppState) -> String {
        let response = send(state, form("POST", "/token", "username=admin&password=admin")).await;
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let h = harness().await;
        let response = send(&h.state, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_protected_routes_reject_anonymous() {
        let h = harness().await;
        for uri in ["/schedule", "/manage-schedule", "/status", "/config", "/bacnet/who-is/5"] {
            let response = send(&h.state, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let h = harness().await;

        let response = send(&h.state, form("POST", "/login", "username=admin&password=nope")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "incorrect username or password");

        let response = send(&h.state, form("POST", "/login", "username=admin&password=admin")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/");
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        let session = cookie.split(';').next().unwrap().to_string();

        let request = Request::get("/")
            .header(COOKIE, session.clone())
            .body(Body::empty())
            .unwrap();
        let body = json_body(send(&h.state, request).await).await;
        assert_eq!(body["logged_in"], true);
        assert_eq!(body["user"], "admin");

        let logout = Request::post("/logout")
            .header(COOKIE, session.clone())
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.state, logout).await.status(), StatusCode::FOUND);
        assert_eq!(h.state.session_count(), 0);

        let request = Request::get("/schedule")
            .header(COOKIE, session)
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.state, request).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire_after_idle_ttl() {
        let h = harness().await;
        let ttl = Duration::from_secs(h.state.config().http.session_ttl_secs);
        let token = bearer(&h.state).await;

        // Use inside the TTL keeps the session alive
        tokio::time::advance(ttl / 2).await;
        assert_eq!(send(&h.state, authed_get("/schedule", &token)).await.status(), StatusCode::OK);
        tokio::time::advance(ttl / 2 + Duration::from_secs(1)).await;
        assert_eq!(send(&h.state, authed_get("/schedule", &token)).await.status(), StatusCode::OK);

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert_eq!(
            send(&h.state, authed_get("/schedule", &token)).await.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(h.state.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_prunes_expired_sessions() {
        let h = harness().await;
        let ttl = Duration::from_secs(h.state.config().http.session_ttl_secs);
        for _ in 0..5 {
            bearer(&h.state).await;
        }
        assert_eq!(h.state.session_count(), 5);

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        bearer(&h.state).await;
        assert_eq!(h.state.session_count(), 1);
    }

    #[tokio::test]
    async fn test_manage_schedule_updates_and_redirects() {
        let h = harness().await;
        let token = bearer(&h.state).await;

        let page = json_body(send(&h.state, authed_get("/manage-schedule", &token)).await).await;
        assert_eq!(page["days"].as_array().unwrap().len(), 7);
        assert_eq!(page["time_slots"][0], "00:00");
        assert_eq!(page["time_slots"][23], "23:00");

        let mut request = form(
            "POST",
            "/manage-schedule",
            "day=Saturday&start_time=09:00&end_time=13:00",
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        let response = send(&h.state, request).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/schedule");

        let body = json_body(send(&h.state, authed_get("/schedule", &token)).await).await;
        assert_eq!(body["schedule"]["Saturday"]["start"], "09:00");
        assert_eq!(body["schedule"]["Saturday"]["end"], "13:00");
    }

    #[tokio::test]
    async fn test_manage_schedule_rejects_bad_input() {
        let h = harness().await;
        let token = bearer(&h.state).await;
        let before = h.state.schedule().snapshot();

        for body in [
            "day=Funday&start_time=09:00&end_time=13:00",
            "day=Monday&start_time=09:00&end_time=",
            "day=Monday&start_time=17:00&end_time=09:00",
            "day=Monday&start_time=nine&end_time=13:00",
        ] {
            let mut request = form("POST", "/manage-schedule", body);
            request
                .headers_mut()
                .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
            let response = send(&h.state, request).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        assert_eq!(h.state.schedule().snapshot(), before);
    }

    #[tokio::test]
    async fn test_manage_schedule_reports_bad_day_first() {
        let h = harness().await;
        let token = bearer(&h.state).await;

        let mut request = form(
            "POST",
            "/manage-schedule",
            "day=Funday&start_time=nine&end_time=13:00",
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        let response = send(&h.state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid day: Funday");
    }

    #[tokio::test]
    async fn test_status_and_config_show_published_points() {
        let h = harness().await;
        let token = bearer(&h.state).await;
        h.writer.publish(BinaryPv::Active, Some(Temperature(55.5)));

        let status = json_body(send(&h.state, authed_get("/status", &token)).await).await;
        assert_eq!(status["occupancy"], "active");
        assert_eq!(status["points"]["outside_air_temperature"], 55.5);
        assert_eq!(status["points"]["cycle"], 1);
        assert_eq!(status["schedule_occupied_now"], true);

        let config = json_body(send(&h.state, authed_get("/config", &token)).await).await;
        assert_eq!(config["settings"]["bacnet"]["device_instance"], 999);
        assert!(config["settings"]["users"][0].get("password").is_none());
        assert_eq!(config["objects"]["binary-value,1"]["present-value"], 1);
    }

    #[tokio::test]
    async fn test_bacnet_routes_validate_before_sending() {
        let h = harness().await;
        let token = bearer(&h.state).await;

        let response = send(&h.state, authed_get("/bacnet/devices/5/bogus,1", &token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&h.state, authed_get("/bacnet/devices/5/analog-value,1/present-value%5B", &token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            json_body(response).await["error"]
                .as_str()
                .unwrap()
                .starts_with("property specification incorrect")
        );

        let response = send(&h.state, authed_get("/bacnet/who-is/5?address=nowhere", &token)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Valid request, but nothing is running behind the client
        let response = send(&h.state, authed_get("/bacnet/devices/5/analog-value,1", &token)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_write_null_needs_priority() {
        let h = harness().await;
        let token = bearer(&h.state).await;

        let request = Request::post("/bacnet/devices/5/analog-output,1/present-value")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"value": null}"#))
            .unwrap();
        let response = send(&h.state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "invalid value: null is only for overrides"
        );
    }
}
