use std::{collections::HashMap, fs, path::Path};

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use neo4rs::query;
use serde::Deserialize;
use serde_json::json;
use tokio::spawn;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    error::QaAgentError,
    ingest,
    models::{GeneratedScript, SourceType, TestPlan},
    rag, script, vector_store,
};

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct UploadEntry {
    filename: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    declared_type: Option<String>,
}

#[derive(Deserialize)]
pub struct UploadPayload {
    files: Vec<UploadEntry>,
}

#[derive(Deserialize)]
pub struct GenerateTestCasesPayload {
    query: String,
}

#[derive(Deserialize)]
pub struct GenerateScriptPayload {
    test_case_id: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/upload-documents", post(upload_documents_handler))
        .route("/api/build-knowledge-base", post(build_knowledge_base_handler))
        .route("/api/generate-test-cases", post(generate_test_cases_handler))
        .route("/api/generate-script", post(generate_script_handler))
        .route("/api/status", get(status_handler))
        .route("/api/neo4j-info", get(neo4j_info_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Traducción del error de dominio al cuerpo JSON de la API: siempre el
/// mensaje legible más su código de razón estable.
fn error_response(err: &QaAgentError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        QaAgentError::IngestionIncomplete(_) => StatusCode::BAD_REQUEST,
        QaAgentError::UnknownTestCase(_) => StatusCode::NOT_FOUND,
        QaAgentError::KnowledgeBaseNotReady(_) => StatusCode::CONFLICT,
        QaAgentError::NoValidOutput(_)
        | QaAgentError::NoMarkupEvidence(_)
        | QaAgentError::SelectorValidationFailed(_)
        | QaAgentError::GroundingViolation(_)
        | QaAgentError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
        QaAgentError::EmbeddingService(_) | QaAgentError::CompletionService(_) => {
            StatusCode::BAD_GATEWAY
        }
        QaAgentError::Storage(_) | QaAgentError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "reason_code": err.reason_code(),
        })),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "reason_code": "BAD_REQUEST" })),
    )
}

// --- Handlers ---

#[axum::debug_handler]
async fn upload_documents_handler(
    State(state): State<AppState>,
    Json(payload): Json<UploadPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if payload.files.is_empty() {
        return Err(bad_request("El lote de subida está vacío."));
    }

    let upload_dir = Path::new(&state.config.upload_dir);
    fs::create_dir_all(upload_dir)
        .map_err(|e| error_response(&QaAgentError::io(upload_dir, e)))?;

    // Limpiar el lote anterior: una subida define el lote completo.
    for entry in fs::read_dir(upload_dir)
        .map_err(|e| error_response(&QaAgentError::io(upload_dir, e)))?
        .flatten()
    {
        if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("No se pudo borrar {}: {e}", entry.path().display());
            }
        }
    }

    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut filenames = Vec::new();

    for file in &payload.files {
        let filename = file.filename.trim();
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(bad_request(&format!(
                "Nombre de fichero no válido: {:?}",
                file.filename
            )));
        }

        let bytes: Vec<u8> = match (&file.content, &file.content_base64) {
            (Some(text), None) => text.clone().into_bytes(),
            (None, Some(b64)) => base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| {
                    bad_request(&format!("content_base64 ilegible para {filename}: {e}"))
                })?,
            _ => {
                return Err(bad_request(&format!(
                    "El fichero {filename} debe traer exactamente uno de 'content' o 'content_base64'."
                )));
            }
        };

        if let Some(declared) = &file.declared_type {
            if SourceType::from_str(declared).is_none() {
                return Err(bad_request(&format!(
                    "declared_type desconocido para {filename}: {declared} (use 'support_doc' o 'markup')"
                )));
            }
            manifest.insert(filename.to_string(), declared.clone());
        }

        let path = upload_dir.join(filename);
        fs::write(&path, bytes).map_err(|e| error_response(&QaAgentError::io(path, e)))?;
        filenames.push(filename.to_string());
    }

    if !manifest.is_empty() {
        let manifest_path = upload_dir.join(ingest::MANIFEST_FILENAME);
        let raw = serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".into());
        fs::write(&manifest_path, raw)
            .map_err(|e| error_response(&QaAgentError::io(manifest_path, e)))?;
    }

    info!("Subidos {} ficheros al lote.", filenames.len());
    Ok((
        StatusCode::OK,
        Json(json!({
            "message": format!("Se han subido {} ficheros correctamente.", filenames.len()),
            "filenames": filenames,
        })),
    ))
}

#[axum::debug_handler]
async fn build_knowledge_base_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    {
        let status = state.status.lock().unwrap();
        if status.is_busy {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "Ya hay una construcción en curso.",
                    "reason_code": "BUILD_IN_PROGRESS",
                })),
            ));
        }
    }

    // Validación síncrona de la completitud del lote: si falta un tipo de
    // fuente se rechaza aquí mismo y la construcción anterior queda intacta.
    let files = ingest::scan_upload_dir(Path::new(&state.config.upload_dir))
        .map_err(|e| error_response(&e))?;
    ingest::validate_batch(&files).map_err(|e| error_response(&e))?;

    spawn(async move {
        {
            let mut status = state.status.lock().unwrap();
            status.is_busy = true;
            status.message = "Iniciando indexación...".to_string();
            status.progress = 0.0;
        }

        let result = ingest::build_knowledge_base(
            &state.graph,
            &state.llm_manager,
            &state.config,
            state.status.clone(),
        )
        .await;

        match result {
            Ok((kb, summary)) => {
                let build_id = kb.build_id.clone();
                // Intercambio atómico del puntero activo; los lectores en
                // vuelo siguen anclados a la instantánea anterior.
                let previous = state.install_kb(kb);
                if let Some(previous) = previous {
                    if let Err(e) =
                        vector_store::delete_build(&state.graph, &previous.build_id).await
                    {
                        error!(
                            "No se pudo borrar la construcción anterior {}: {e}",
                            previous.build_id
                        );
                    }
                }
                let mut status = state.status.lock().unwrap();
                status.is_busy = false;
                status.progress = 0.0;
                status.message =
                    format!("¡Indexación completada! Construcción {build_id}. {summary}");
            }
            Err(err) => {
                error!("Error en la construcción de la base de conocimiento: {err}");
                let mut status = state.status.lock().unwrap();
                status.is_busy = false;
                status.progress = 0.0;
                status.message = format!(
                    "Error en la indexación [{}]: {}",
                    err.reason_code(),
                    err
                );
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn generate_test_cases_handler(
    State(state): State<AppState>,
    Json(payload): Json<GenerateTestCasesPayload>,
) -> Result<Json<TestPlan>, (StatusCode, Json<serde_json::Value>)> {
    if payload.query.trim().is_empty() {
        return Err(bad_request("La petición no puede estar vacía."));
    }

    let kb = usable_kb(&state).map_err(|e| error_response(&e))?;

    let plan = rag::generate_test_cases(
        &kb,
        &state.llm_manager,
        &state.config,
        payload.query.trim(),
    )
    .await
    .map_err(|e| error_response(&e))?;

    // Los casos aceptados quedan en la sesión para la síntesis de scripts.
    {
        let mut cases = state.test_cases.lock().unwrap();
        for case in &plan.test_cases {
            cases.insert(case.id.clone(), case.clone());
        }
    }

    info!(
        "Generados {} casos ({} descartados) para la petición.",
        plan.test_cases.len(),
        plan.dropped.len()
    );
    Ok(Json(plan))
}

#[axum::debug_handler]
async fn generate_script_handler(
    State(state): State<AppState>,
    Json(payload): Json<GenerateScriptPayload>,
) -> Result<Json<GeneratedScript>, (StatusCode, Json<serde_json::Value>)> {
    let test_case = {
        let cases = state.test_cases.lock().unwrap();
        cases.get(payload.test_case_id.trim()).cloned()
    };
    let Some(test_case) = test_case else {
        return Err(error_response(&QaAgentError::UnknownTestCase(format!(
            "no hay ningún caso con id {:?} en la sesión actual",
            payload.test_case_id
        ))));
    };

    let kb = usable_kb(&state).map_err(|e| error_response(&e))?;

    let generated = script::generate_script(&kb, &state.llm_manager, &state.config, &test_case)
        .await
        .map_err(|e| error_response(&e))?;

    info!(
        "Script generado para el caso {} con {} selectores validados.",
        generated.test_case_id,
        generated.selectors.len()
    );
    Ok(Json(generated))
}

/// Ancla la petición a la instantánea activa y comprueba que sea utilizable.
fn usable_kb(
    state: &AppState,
) -> crate::error::Result<std::sync::Arc<crate::models::KnowledgeBase>> {
    let kb = state.current_kb().ok_or_else(|| {
        QaAgentError::KnowledgeBaseNotReady(
            "no hay ninguna construcción activa; construya la base de conocimiento primero".into(),
        )
    })?;
    if !kb.is_usable() {
        return Err(QaAgentError::KnowledgeBaseNotReady(format!(
            "la construcción {} no contiene chunks de documentación y de marcado a la vez",
            kb.build_id
        )));
    }
    Ok(kb)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn neo4j_info_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let browser_url = match Url::parse(&state.config.neo4j_uri) {
        Ok(mut url) => {
            let _ = url.set_scheme("http");
            let _ = url.set_port(Some(7474));
            url.to_string()
        }
        Err(_) => "http://localhost:7474".to_string(),
    };

    match state.graph.run(query("RETURN 1")).await {
        Ok(_) => Ok(Json(json!({ "status": "ok", "browser_url": browser_url }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
