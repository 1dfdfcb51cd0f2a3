use crate::configs::AppConfig;
use crate::generate_device_cert::DeviceCertificateIssuer;
use crate::protocol::{deserialize_request, PkiResponse};
use crate::registry::{CloudIotRegistry, DeviceRegistry};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    AUTHORIZATION, CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const JSON_CONTENT_TYPE: &str = "application/json";
const CORS_ALLOWED_HEADERS: &str = "Content-Type,Authorization";
const CORS_ALLOWED_METHODS: &str = "POST";

pub struct AppState {
    pub issuer: Arc<DeviceCertificateIssuer>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub auth_token: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/_ah/start", any(start))
        .route("/_ah/warmup", any(warmup))
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the registration service until Ctrl-C
pub async fn serve(config: AppConfig) -> Result<()> {
    if config.server.auth_token == crate::configs::AUTH_TOKEN_DEFAULT {
        tracing::warn!("using the default auth token; set REGISTRATION_SERVICE_AUTH_TOKEN");
    }

    let registry = CloudIotRegistry::new(config.registry.clone())
        .context("Failed to create registry client")?;
    let state = Arc::new(AppState {
        issuer: Arc::new(DeviceCertificateIssuer::from_config(&config)),
        registry: Arc::new(registry),
        auth_token: config.server.auth_token.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "registration service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("HTTP server failed")
}

async fn start() -> StatusCode {
    tracing::info!("starting an instance");
    StatusCode::OK
}

async fn warmup(State(state): State<Arc<AppState>>) -> StatusCode {
    tracing::info!("warming up an instance");
    let issuer = Arc::clone(&state.issuer);
    match tokio::task::spawn_blocking(move || issuer.ca_store().load().map(|_| ())).await {
        Ok(Ok(())) => {}
        // The CA store already logged the cause.
        Ok(Err(_)) => {}
        Err(e) => tracing::error!(error = %e, "CA warmup task failed"),
    }
    StatusCode::OK
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut response = match method {
        Method::POST => register(&state, &headers, &body).await,
        Method::OPTIONS => {
            let mut response = StatusCode::OK.into_response();
            let response_headers = response.headers_mut();
            response_headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(CORS_ALLOWED_HEADERS),
            );
            response_headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(CORS_ALLOWED_METHODS),
            );
            response
        }
        other => {
            tracing::error!(method = %other, "unsupported HTTP method");
            error_response(StatusCode::METHOD_NOT_ALLOWED)
        }
    };
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

async fn register(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
        .unwrap_or_default();
    if token.is_empty() {
        tracing::info!("authorization token is missing");
        return error_response(StatusCode::UNAUTHORIZED);
    }
    if !token_matches(token, &state.auth_token) {
        tracing::info!("authorization token is incorrect");
        return error_response(StatusCode::UNAUTHORIZED);
    }

    let request = match deserialize_request(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "failed to unmarshal request");
            return error_response(StatusCode::BAD_REQUEST);
        }
    };
    if request.name.is_empty() {
        tracing::warn!("request is missing device name");
        return error_response(StatusCode::BAD_REQUEST);
    }

    let issuer = Arc::clone(&state.issuer);
    let name = request.name.clone();
    let credentials = match tokio::task::spawn_blocking(move || issuer.issue(&name)).await {
        Ok(Ok(credentials)) => credentials,
        Ok(Err(e)) => {
            tracing::warn!(device = %request.name, error = %e, "failed to generate a new RSA certificate and key");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            tracing::error!(device = %request.name, error = %e, "issuance task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let path = match state
        .registry
        .register_device(&request.name, credentials.certificate_pem())
        .await
    {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(device = %request.name, error = %e, "failed to register device");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    tracing::debug!(device = %request.name, %path, "new device has been registered");
    let response = PkiResponse::new(
        request.name,
        credentials.private_key_pem().expose_secret(),
        path,
    );
    (StatusCode::OK, Json(response)).into_response()
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && openssl::memcmp::eq(presented.as_bytes(), expected.as_bytes())
}

fn error_response(status: StatusCode) -> Response {
    (status, [(CONTENT_TYPE, JSON_CONTENT_TYPE)]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_store::CaStore;
    use crate::error::RegistryError;
    use crate::generate_csr::SubjectTemplate;
    use crate::generate_root_ca::{write_ca_files, RsaRootCABuilder};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    #[derive(Default)]
    struct FakeRegistry {
        registered: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeviceRegistry for FakeRegistry {
        async fn register_device(
            &self,
            name: &str,
            certificate_pem: &str,
        ) -> Result<String, RegistryError> {
            if self.fail {
                return Err(RegistryError::MissingResourceName);
            }
            self.registered
                .lock()
                .push((name.to_string(), certificate_pem.to_string()));
            Ok(format!("https://devices.example.test/v1/devices/{name}"))
        }
    }

    fn template() -> SubjectTemplate {
        SubjectTemplate {
            country: "US".to_string(),
            province: "California".to_string(),
            locality: "Irvine".to_string(),
            organization: "Neudesic".to_string(),
            organizational_unit: "GCP".to_string(),
        }
    }

    fn state(dir: &tempfile::TempDir, with_ca: bool, registry: Arc<FakeRegistry>) -> Arc<AppState> {
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");
        if with_ca {
            let (key, cert) = RsaRootCABuilder::new()
                .subject_common_name("Test Device CA".to_string())
                .validity_days(1)
                .build()
                .unwrap();
            write_ca_files(&key, &cert, &cert_path, &key_path).unwrap();
        }
        let issuer = DeviceCertificateIssuer::new(
            Arc::new(CaStore::new(cert_path, key_path)),
            template(),
            Duration::from_secs(3600),
        );
        Arc::new(AppState {
            issuer: Arc::new(issuer),
            registry,
            auth_token: TOKEN.to_string(),
        })
    }

    fn post(body: &'static str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_register_issues_and_registers_device() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let app = router(state(&dir, true, Arc::clone(&registry)));

        let response = app
            .oneshot(post(r#"{"name":"sensor-01"}"#, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);

        let body: PkiResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.name, "sensor-01");
        assert_eq!(body.path, "https://devices.example.test/v1/devices/sensor-01");

        let registered = registry.registered.lock();
        assert_eq!(registered.len(), 1);
        let (name, certificate_pem) = &registered[0];
        assert_eq!(name, "sensor-01");

        let certificate = X509::from_pem(certificate_pem.as_bytes()).unwrap();
        let key_pem = body.private_key_pem().unwrap();
        let key = PKey::from_rsa(Rsa::private_key_from_pem(key_pem.as_bytes()).unwrap()).unwrap();
        assert!(certificate.public_key().unwrap().public_eq(&key));
    }

    #[tokio::test]
    async fn test_register_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let app = router(state(&dir, false, Arc::clone(&registry)));

        let missing = app
            .clone()
            .oneshot(post(r#"{"name":"sensor-01"}"#, None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let wrong = app
            .oneshot(post(r#"{"name":"sensor-01"}"#, Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert!(registry.registered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, false, Arc::new(FakeRegistry::default())));

        let garbage = app
            .clone()
            .oneshot(post("not json", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

        let nameless = app.oneshot(post("{}", Some(TOKEN))).await.unwrap();
        assert_eq!(nameless.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_ca_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let app = router(state(&dir, false, Arc::clone(&registry)));

        let response = app
            .oneshot(post(r#"{"name":"sensor-01"}"#, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(registry.registered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_registry_failure_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry {
            fail: true,
            ..FakeRegistry::default()
        });
        let app = router(state(&dir, true, registry));

        let response = app
            .oneshot(post(r#"{"name":"sensor-01"}"#, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_preflight_and_unsupported_methods() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, false, Arc::new(FakeRegistry::default())));

        let preflight = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(preflight.status(), StatusCode::OK);
        assert_eq!(preflight.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            preflight.headers()[ACCESS_CONTROL_ALLOW_HEADERS],
            CORS_ALLOWED_HEADERS
        );
        assert_eq!(preflight.headers()[ACCESS_CONTROL_ALLOW_METHODS], "POST");

        let get = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_warmup_loads_ca() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, true, Arc::new(FakeRegistry::default()));
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_ah/warmup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.issuer.ca_store().is_loaded());
    }

    #[tokio::test]
    async fn test_lifecycle_endpoints_accept_any_method() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, false, Arc::new(FakeRegistry::default())));

        for (method, uri) in [("POST", "/_ah/start"), ("GET", "/_ah/start"), ("POST", "/_ah/warmup")] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{method} {uri}");
        }
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("abc", "abc"));
        assert!(!token_matches("abd", "abc"));
        assert!(!token_matches("abcd", "abc"));
    }
}
