mod docs;
pub mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use pinhost_acme::Issuer;
use pinhost_store::StateStore;

use self::handlers::*;

/// CSRs are small; anything bigger than this is not a CSR.
pub const MAX_CSR_BYTES: usize = 10 * 1024;

/// Shared state for the public API.
pub struct AppState<S> {
    pub origin: String,
    pub issuer: Arc<Issuer<S>>,
    pub www_dir: PathBuf,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            origin: self.origin.clone(),
            issuer: Arc::clone(&self.issuer),
            www_dir: self.www_dir.clone(),
        }
    }
}

/// Build the public API router.
///
/// GET/HEAD on an endpoint serves its plain-text description; POST runs
/// the operation. Every response carries permissive CORS so the landing
/// page (or anyone's page) can call the API from a browser.
pub fn router<S: StateStore>(state: AppState<S>) -> Router {
    Router::new()
        .route(
            "/hostname-from-cert",
            get(|| async { docs::HOSTNAME_FROM_CERT }).post(hostname_from_cert::<S>),
        )
        .route(
            "/hostname-from-csr",
            get(|| async { docs::HOSTNAME_FROM_CSR }).post(hostname_from_csr::<S>),
        )
        .route(
            "/hostname-from-key",
            get(|| async { docs::HOSTNAME_FROM_KEY }).post(hostname_from_key::<S>),
        )
        .route("/csr-from-key", get(|| async { docs::CSR_FROM_KEY }).post(csr_from_key::<S>))
        .route("/key", get(|| async { docs::KEY }).post(key::<S>))
        .route(
            "/cert-from-csr",
            get(|| async { docs::CERT_FROM_CSR })
                .post(cert_from_csr::<S>)
                .layer(DefaultBodyLimit::max(MAX_CSR_BYTES)),
        )
        .route(
            "/cert-from-key",
            get(|| async { docs::CERT_FROM_KEY }).post(cert_from_key::<S>),
        )
        .route("/cert/{hostname}", get(cert_by_hostname::<S>))
        .fallback(static_site::<S>)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Permissive CORS on every response.
async fn cors(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("Access-Control-Allow-Origin", http::HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Headers",
        http::HeaderValue::from_static("Content-Type"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use pinhost_acme::account::AccountKey;
    use pinhost_acme::{Client, IssuerConfig};
    use pinhost_store::LocalStore;
    use tokio::sync::Mutex;
    use tower::util::ServiceExt;

    const ORIGIN: &str = "tls.example";

    fn test_state() -> AppState<LocalStore> {
        let client = Client::test_stub(AccountKey::generate().unwrap());
        let issuer = Issuer::new(
            Arc::new(Mutex::new(client)),
            LocalStore::new(),
            IssuerConfig::default(),
        );
        AppState {
            origin: ORIGIN.to_string(),
            issuer: Arc::new(issuer),
            www_dir: PathBuf::from("/nonexistent"),
        }
    }

    async fn send(router: Router, req: HttpRequest<Body>) -> (StatusCode, String) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn get_serves_endpoint_docs_with_cors() {
        let router = router(test_state());
        let req = HttpRequest::get("/hostname-from-csr").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Access-Control-Allow-Origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn hostname_from_key_round_trip() {
        let state = test_state();
        let store = state.issuer.cache().store().clone();
        let router = router(state);

        let key = pinhost_pin::generate_key().unwrap();
        let expected = pinhost_pin::hostname(&key, ORIGIN).unwrap();

        let req = HttpRequest::post("/hostname-from-key").body(Body::from(key)).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, expected);

        // Side effect: the CSR is now cached under the wildcard subject.
        let row = store.read_state(|fsm| fsm.cert(&format!("*.{expected}")).cloned());
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn hostname_from_csr_returns_base_name() {
        let router = router(test_state());
        let key = pinhost_pin::generate_key().unwrap();
        let hostname = pinhost_pin::hostname(&key, ORIGIN).unwrap();
        let csr = pinhost_pin::generate_csr(&key, &hostname).unwrap();

        let req = HttpRequest::post("/hostname-from-csr").body(Body::from(csr)).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, hostname);
    }

    #[tokio::test]
    async fn csr_with_foreign_san_is_rejected() {
        let router = router(test_state());

        // CSR claiming an extra SAN alongside the pinned one.
        let key = pinhost_pin::generate_key().unwrap();
        let hostname = pinhost_pin::hostname(&key, ORIGIN).unwrap();
        let key_pair = rcgen::KeyPair::from_pem(&key).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![
            format!("*.{hostname}"),
            "*.attacker.tls.example".to_string(),
        ])
        .unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params.serialize_request(&key_pair).unwrap().pem().unwrap();

        let req = HttpRequest::post("/hostname-from-csr").body(Body::from(csr)).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body.contains("CSR does not match expected hostname: *.attacker.tls.example"),
            "unexpected body: {body}"
        );
    }

    #[tokio::test]
    async fn csr_from_key_returns_pem() {
        let router = router(test_state());
        let key = pinhost_pin::generate_key().unwrap();
        let req = HttpRequest::post("/csr-from-key").body(Body::from(key)).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("CERTIFICATE REQUEST"));
    }

    #[tokio::test]
    async fn key_endpoint_generates_pem_key() {
        let router = router(test_state());
        let req = HttpRequest::post("/key").body(Body::empty()).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn oversized_csr_gets_413() {
        let router = router(test_state());
        let req = HttpRequest::post("/cert-from-csr")
            .body(Body::from(vec![0u8; MAX_CSR_BYTES + 1]))
            .unwrap();
        let (status, _) = send(router, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_hostname_cert_is_404() {
        let router = router(test_state());
        let req = HttpRequest::get("/cert/not.seen.before").body(Body::empty()).unwrap();
        let (status, _) = send(router, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hostname_from_cert_strips_wildcard() {
        let router = router(test_state());

        let mut params =
            rcgen::CertificateParams::new(vec!["*.a.b.tls.example".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let req =
            HttpRequest::post("/hostname-from-cert").body(Body::from(cert.pem())).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "a.b.tls.example");
    }

    #[tokio::test]
    async fn missing_static_file_is_404() {
        let router = router(test_state());
        let req = HttpRequest::get("/no-such-page.html").body(Body::empty()).unwrap();
        let (status, _) = send(router, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
