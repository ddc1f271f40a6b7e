use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use pinhost_acme::AcmeError;
use pinhost_pin::PinError;
use pinhost_store::StateStore;

use super::AppState;

/// An error already shaped for the HTTP client.
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, format!("{}\n", self.1)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Client-caused failures are 400s; everything else is an upstream or
/// store problem and surfaces as 500 with the wrapped error text.
fn acme_error(context: &str, err: AcmeError) -> ApiError {
    match &err {
        AcmeError::Pin(_) => ApiError(StatusCode::BAD_REQUEST, format!("{context}: {err}")),
        _ => {
            tracing::warn!("{context}: {err}");
            ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {err}"))
        }
    }
}

fn pin_error(context: &str, err: PinError) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, format!("{context}: {err}"))
}

fn text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn pem_file(filename: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/x-pem-file".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response()
}

fn cert_file(filename: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/x-x509-ca-cert".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response()
}

/// POST /hostname-from-cert — recover the base name from an issued cert.
pub async fn hostname_from_cert<S: StateStore>(
    State(_state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let (_, block) = x509_parser::pem::parse_x509_pem(&body).map_err(|e| {
        ApiError(StatusCode::BAD_REQUEST, format!("Failed to decode PEM certificate: {e}"))
    })?;
    let (_, cert) = X509Certificate::from_der(&block.contents).map_err(|e| {
        ApiError(StatusCode::BAD_REQUEST, format!("Failed to parse certificate: {e}"))
    })?;

    let hostname = cert_hostname(&cert).ok_or_else(|| {
        ApiError(
            StatusCode::BAD_REQUEST,
            "No common name or DNS names found in certificate".to_string(),
        )
    })?;

    Ok(text(hostname.trim_start_matches("*.").to_string()))
}

fn cert_hostname(cert: &X509Certificate<'_>) -> Option<String> {
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .filter(|cn| !cn.is_empty())
    {
        return Some(cn.to_string());
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                return Some((*dns).to_string());
            }
        }
    }
    None
}

/// POST /hostname-from-csr — validate a CSR and remember it.
pub async fn hostname_from_csr<S: StateStore>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let base = state
        .issuer
        .cache()
        .put_csr(&body, &state.origin)
        .await
        .map_err(|e| acme_error("CSR validation failed", e))?;
    Ok(text(base))
}

/// POST /hostname-from-key — derive the pinned hostname for a key.
pub async fn hostname_from_key<S: StateStore>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let key_pem = String::from_utf8_lossy(&body);
    let hostname = pinhost_pin::hostname(&key_pem, &state.origin)
        .map_err(|e| pin_error("Failed to extract hostname", e))?;

    // First sighting of this key? Generate and remember the CSR now.
    state
        .issuer
        .cache()
        .put_key(&key_pem, &state.origin)
        .await
        .map_err(|e| acme_error("Failed to cache CSR", e))?;

    Ok(text(hostname))
}

/// POST /csr-from-key — build (and remember) the CSR for a key.
pub async fn csr_from_key<S: StateStore>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let key_pem = String::from_utf8_lossy(&body);
    let hostname = pinhost_pin::hostname(&key_pem, &state.origin)
        .map_err(|e| pin_error("Failed to generate hostname", e))?;
    let csr = pinhost_pin::generate_csr(&key_pem, &hostname)
        .map_err(|e| pin_error("Failed to generate CSR", e))?;

    state
        .issuer
        .cache()
        .put_csr(csr.as_bytes(), &state.origin)
        .await
        .map_err(|e| acme_error("Failed to cache CSR", e))?;

    Ok(pem_file("csr.pem", csr))
}

/// POST /key — generate a key server-side.
pub async fn key<S: StateStore>(State(state): State<AppState<S>>) -> ApiResult {
    let key_pem =
        pinhost_pin::generate_key().map_err(|e| pin_error("Failed to generate key", e))?;

    state
        .issuer
        .cache()
        .put_key(&key_pem, &state.origin)
        .await
        .map_err(|e| acme_error("Failed to cache CSR", e))?;

    Ok(pem_file("key.pem", key_pem))
}

/// POST /cert-from-csr — the main issuance path.
pub async fn cert_from_csr<S: StateStore>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let der = pinhost_pin::decode_csr(&body).map_err(|e| pin_error("Failed to decode CSR", e))?;
    let base = state
        .issuer
        .cache()
        .put_csr(&der, &state.origin)
        .await
        .map_err(|e| acme_error("CSR validation failed", e))?;

    let chain = state
        .issuer
        .request_cert(&base, &der)
        .await
        .map_err(|e| acme_error("Failed to get certificate", e))?;

    Ok(cert_file("cert.pem", chain))
}

/// POST /cert-from-key — server does everything including the CSR.
pub async fn cert_from_key<S: StateStore>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> ApiResult {
    let key_pem = String::from_utf8_lossy(&body);
    let hostname = pinhost_pin::hostname(&key_pem, &state.origin)
        .map_err(|e| pin_error("Failed to generate hostname", e))?;
    let csr_pem = pinhost_pin::generate_csr(&key_pem, &hostname)
        .map_err(|e| pin_error("Failed to generate CSR", e))?;
    let der = pinhost_pin::decode_csr(csr_pem.as_bytes())
        .map_err(|e| pin_error("Failed to decode CSR", e))?;

    state
        .issuer
        .cache()
        .put_csr(&der, &state.origin)
        .await
        .map_err(|e| acme_error("Failed to cache CSR", e))?;

    let chain = state
        .issuer
        .request_cert(&hostname, &der)
        .await
        .map_err(|e| acme_error("Failed to get certificate", e))?;

    Ok(cert_file("cert.pem", chain))
}

/// GET /cert/{hostname} — fetch (and renew if needed) by hostname alone.
pub async fn cert_by_hostname<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(hostname): Path<String>,
) -> ApiResult {
    let row = state
        .issuer
        .cache()
        .get(&format!("*.{hostname}"))
        .await
        .map_err(|e| acme_error("Failed to read certificate cache", e))?;
    if row.csr.is_empty() {
        return Err(ApiError(StatusCode::NOT_FOUND, "CSR not found in cache".to_string()));
    }

    let chain = state
        .issuer
        .request_cert(&hostname, &row.csr)
        .await
        .map_err(|e| acme_error("Failed to retrieve certificate", e))?;

    Ok(cert_file(&format!("{hostname}.pem"), chain))
}

/// Fallback: the static landing site from the configuration directory.
pub async fn static_site<S: StateStore>(
    State(state): State<AppState<S>>,
    uri: Uri,
) -> ApiResult {
    let rel = uri.path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    if rel.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(ApiError(StatusCode::NOT_FOUND, "not found".to_string()));
    }

    let path = state.www_dir.join(rel);
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError(StatusCode::NOT_FOUND, "not found".to_string()))?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
