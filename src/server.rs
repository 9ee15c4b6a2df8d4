/* This is part of smartblock-agent - which is under the MIT License **********/

//! HTTP front of the agent, on localhost only.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use snafu::ResultExt;
use log::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::error;
use crate::interrupt::Shutdown;
use crate::service::{Agent, CompileOutcome, CoreRequest, SketchRequest};

/// Sketches are small, but leave room for generated code
const MAX_BODY: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
    origins: Arc<Vec<String>>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/init", post(init))
        .route("/install-core", post(install_core))
        .route("/boards", get(boards))
        .route("/compile", post(compile))
        .route("/compile-upload", post(compile_upload))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .layer(middleware::from_fn_with_state(state.clone(), check_origin))
        .with_state(state)
}

/// Run a pipeline on the blocking pool
async fn offload<T, F>(agent: Arc<Agent>, job: F) -> Result<T>
where
    F: FnOnce(&Agent) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || job(&agent))
        .await
        .context(error::WorkerFailed{})?
}

/// Decode a JSON body. A missing body reads as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).context(error::BadRequestBody{})
}

fn failure(route: &str, err: Error) -> Response {
    let message = err.user_message();
    let status = if err.is_client_error() {
        warn!("{}: {}", route, message);
        StatusCode::BAD_REQUEST
    } else {
        error!("{}: {}", route, message);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

fn respond(route: &str, result: Result<Value>) -> Response {
    match result {
        Ok(mut body) => {
            if let Some(fields) = body.as_object_mut() {
                fields.insert("ok".to_string(), Value::Bool(true));
            }
            Json(body).into_response()
        },
        Err(err) => failure(route, err),
    }
}

fn compile_body(outcome: CompileOutcome) -> Value {
    json!({
        "format": outcome.artifact.format.as_str(),
        "artifact": base64::engine::general_purpose::STANDARD.encode(&outcome.artifact.bytes),
        "stdout": outcome.log,
    })
}

async fn health(State(state): State<AppState>) -> Response {
    Json(state.agent.health()).into_response()
}

async fn version(State(state): State<AppState>) -> Response {
    let result = offload(state.agent, |agent| agent.version()).await
        .map(|version| json!({ "version": version }));
    respond("/version", result)
}

async fn init(State(state): State<AppState>) -> Response {
    let result = offload(state.agent, |agent| agent.init()).await
        .map(|()| json!({}));
    respond("/init", result)
}

async fn install_core(State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body::<CoreRequest>(&body) {
        Ok(request) => offload(state.agent, move |agent| agent.install_core(&request)).await
            .map(|stdout| json!({ "stdout": stdout })),
        Err(err) => Err(err),
    };
    respond("/install-core", result)
}

async fn boards(State(state): State<AppState>) -> Response {
    let result = offload(state.agent, |agent| agent.boards()).await
        .map(|data| json!({ "data": data }));
    respond("/boards", result)
}

async fn compile(State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body::<SketchRequest>(&body) {
        Ok(request) => offload(state.agent, move |agent| agent.compile(&request)).await
            .map(compile_body),
        Err(err) => Err(err),
    };
    respond("/compile", result)
}

async fn compile_upload(State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body::<SketchRequest>(&body) {
        Ok(request) => offload(state.agent, move |agent| agent.compile_upload(&request)).await
            .map(|outcome| json!({ "upload": outcome.log, "stdout": outcome.compile_log })),
        Err(err) => Err(err),
    };
    respond("/compile-upload", result)
}

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|candidate| candidate == origin)
}

/// Cross-origin gate. Requests without an Origin header (curl, the desktop
/// shell) pass untouched; browsers must come from an allowed origin.
async fn check_origin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = match request.headers().get(header::ORIGIN) {
        Some(origin) => origin.clone(),
        None => return next.run(request).await,
    };
    let allowed = origin.to_str()
        .map(|origin| origin_allowed(&state.origins, origin))
        .unwrap_or(false);
    if ! allowed {
        warn!("Refusing request from origin {:?}", origin);
        return (StatusCode::FORBIDDEN,
                Json(json!({ "ok": false, "error": "origin not allowed" }))).into_response();
    }

    let preflight = request.method() == Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    if preflight {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS,
                       HeaderValue::from_static("GET, POST, OPTIONS"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS,
                       HeaderValue::from_static("Content-Type"));
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    }
    response
}

/// Get arduino-cli ready in the background so that the first request
/// does not pay for the download.
async fn prepare(agent: Arc<Agent>) {
    match offload(agent, |agent| agent.prepare()).await {
        Ok(bin) => info!("arduino-cli ready at {:#?}", bin),
        Err(err) => error!("Failed to prepare arduino-cli: {}", err),
    }
}

pub async fn serve(config: &Config, agent: Agent, shutdown: Shutdown) -> Result<()> {
    let state = AppState {
        agent: Arc::new(agent),
        origins: Arc::new(config.allowed_origins.clone()),
    };
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await
        .context(error::ServerBind{ addr: addr })?;
    info!("SmartBlock agent on http://localhost:{}", config.port);

    if config.prepare_on_start {
        tokio::spawn(prepare(state.agent.clone()));
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.wait())
        .await
        .context(error::ServerFailed{})?;
    info!("SmartBlock agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactFormat, BuildArtifact};
    use crate::download::testing::ScriptedTransport;
    use crate::platform::PlatformProfile;
    use crate::process::{Output, Runner};
    use crate::process::testing::{Call, StubRunner, stdout};
    use crate::toolchain::{InstallMode, Toolchain, ToolchainOptions};
    use axum::body::Body;
    use std::path::Path;
    use tower::ServiceExt;

    const EDITOR: &str = "http://localhost:5173";

    async fn body_of(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn only_listed_origins_are_allowed() {
        let allowed = vec![
            "http://localhost:5173".to_string(),
            "https://smartblock.vercel.app".to_string(),
        ];
        assert!(origin_allowed(&allowed, "http://localhost:5173"));
        assert!(origin_allowed(&allowed, "https://smartblock.vercel.app"));
        assert!(! origin_allowed(&allowed, "http://localhost:5174"));
        assert!(! origin_allowed(&allowed, "https://smartblock.vercel.app.evil.example"));
        assert!(! origin_allowed(&[], "http://localhost:5173"));
    }

    #[test]
    fn empty_body_reads_as_an_empty_object() {
        let request: SketchRequest = parse_body(&Bytes::new()).unwrap();
        assert!(request.ino.is_none());
        let request: CoreRequest = parse_body(&Bytes::from_static(b" \n")).unwrap();
        assert!(request.core.is_none());

        let request: SketchRequest = parse_body(&Bytes::from_static(
            br#"{"ino":"void setup(){}","fqbn":"arduino:avr:uno","extra":1}"#)).unwrap();
        assert_eq!(request.fqbn.as_deref(), Some("arduino:avr:uno"));
    }

    #[test]
    fn malformed_body_is_a_client_error() {
        let err = parse_body::<SketchRequest>(&Bytes::from_static(b"{ino:")).unwrap_err();
        assert!(matches!(err, Error::BadRequestBody { .. }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn compile_response_carries_the_encoded_artifact() {
        let outcome = CompileOutcome {
            artifact: BuildArtifact {
                path: "sketch.ino.hex".into(),
                format: ArtifactFormat::Hex,
                bytes: vec![0x01, 0x02],
            },
            log: "Sketch uses 444 bytes".to_string(),
        };
        let response = respond("/compile", Ok(compile_body(outcome)));
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_of(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["format"], "hex");
        assert_eq!(body["stdout"], "Sketch uses 444 bytes");
        let artifact = base64::engine::general_purpose::STANDARD
            .decode(body["artifact"].as_str().unwrap()).unwrap();
        assert_eq!(artifact, vec![0x01u8, 0x02]);
    }

    #[tokio::test]
    async fn failures_map_to_status_codes() {
        let response = respond("/compile", error::MissingRequiredField{ field: "ino/fqbn" }.fail());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, json!({ "ok": false, "error": "missing ino/fqbn" }));

        let response = respond("/compile", error::ProcessFailed {
            proc: "arduino-cli",
            code: Some(1),
            stdout: "",
            stderr: "exit status 1",
        }.fail());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response).await, json!({ "ok": false, "error": "exit status 1" }));
    }

    fn app(dir: &Path, runner: Arc<dyn Runner>) -> Router {
        let cli = dir.join("arduino-cli");
        std::fs::write(&cli, b"#!/bin/sh\n").unwrap();
        let toolchain = Toolchain::new(ToolchainOptions {
            profile: PlatformProfile::new("linux", "x86_64"),
            cli_path: Some(cli),
            install_dir: dir.join("install"),
            mode: InstallMode::SearchOnly,
            search_path: Some(dir.join("empty-path").into_os_string()),
        }, Arc::new(ScriptedTransport::new()));
        let agent = Agent::with_parts(toolchain, runner, 5055, Some(dir.join("work")));
        router(AppState {
            agent: Arc::new(agent),
            origins: Arc::new(vec![EDITOR.to_string()]),
        })
    }

    fn request(method: Method, uri: &str, origin: Option<&str>, body: Body)
        -> axum::http::Request<Body>
    {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(body).unwrap()
    }

    fn compile_ok(call: &Call) -> Result<Output> {
        if call.args[0] == "compile" {
            let at = call.args.iter().position(|arg| arg == "--output-dir").unwrap();
            std::fs::write(Path::new(&call.args[at + 1]).join("sketch.ino.hex"), [0x01u8, 0x02]).unwrap();
        }
        stdout("done")
    }

    const SKETCH_BODY: &str = r#"{"ino":"void setup(){} void loop(){}","fqbn":"arduino:avr:uno"}"#;

    #[tokio::test]
    async fn requests_without_origin_pass_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Arc::new(StubRunner::new(compile_ok)));

        let response = app.oneshot(request(Method::GET, "/health", None, Body::empty()))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        let body = body_of(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["agent"], "smartblock");
        assert_eq!(body["port"], 5055);
    }

    #[tokio::test]
    async fn allowed_origin_gets_cors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Arc::new(StubRunner::new(compile_ok)));

        let response = app.oneshot(request(Method::GET, "/health", Some(EDITOR), Body::empty()))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], EDITOR);
        assert_eq!(response.headers()[header::VARY], "Origin");
    }

    #[tokio::test]
    async fn preflight_is_answered_without_running_anything() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::new(compile_ok));
        let app = app(dir.path(), runner.clone());

        let response = app.oneshot(request(Method::OPTIONS, "/compile", Some(EDITOR), Body::empty()))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], EDITOR);
        assert!(headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap().contains("POST"));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn other_origins_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::new(compile_ok));
        let app = app(dir.path(), runner.clone());

        let response = app.oneshot(request(Method::POST, "/compile",
                Some("https://smartblock.example"), Body::from(SKETCH_BODY)))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert_eq!(body_of(response).await, json!({ "ok": false, "error": "origin not allowed" }));
        assert!(runner.calls().is_empty());
        assert!(! dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::new(compile_ok));
        let app = app(dir.path(), runner.clone());

        let body = vec![b' '; MAX_BODY + 1024];
        let response = app.oneshot(request(Method::POST, "/compile", None, Body::from(body)))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn compile_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Arc::new(StubRunner::new(compile_ok)));

        let response = app.oneshot(request(Method::POST, "/compile", Some(EDITOR),
                Body::from(SKETCH_BODY)))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_of(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["format"], "hex");
        assert_eq!(body["artifact"], "AQI=");
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn compile_upload_without_port_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::new(compile_ok));
        let app = app(dir.path(), runner.clone());

        let response = app.oneshot(request(Method::POST, "/compile-upload", None,
                Body::from(SKETCH_BODY)))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, json!({ "ok": false, "error": "missing port" }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn compile_upload_reports_both_logs() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Arc::new(StubRunner::new(|call: &Call| {
            match call.args[0].as_str() {
                "compile" => stdout("compiled"),
                _ => stdout("uploaded"),
            }
        })));

        let body = r#"{"ino":"void setup(){}","fqbn":"arduino:avr:uno","port":"/dev/ttyACM0"}"#;
        let response = app.oneshot(request(Method::POST, "/compile-upload", None, Body::from(body)))
            .await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await,
            json!({ "ok": true, "upload": "uploaded", "stdout": "compiled" }));
    }
}
