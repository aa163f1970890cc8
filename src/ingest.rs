//! Ingesta de un lote de ficheros subidos: clasificación por tipo de
//! fuente, troceado, embeddings y persistencia de la construcción completa.
//!
//! La construcción es una transacción lógica: o el lote entero acaba en una
//! instantánea nueva, o no cambia nada. El intercambio del puntero activo lo
//! hace el llamante una vez que esta función devuelve con éxito.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use mime_guess::MimeGuess;
use neo4rs::Graph;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    app_state::Status,
    chunker,
    config::AppConfig,
    error::{QaAgentError, Result},
    llm::LlmManager,
    models::{ChunkNode, DocumentNode, IngestionSummary, KnowledgeBase, SourceType},
    vector_store,
};

/// Manifiesto de tipos declarados que acompaña a cada lote subido.
pub const MANIFEST_FILENAME: &str = ".upload_manifest.json";

/// Fichero de un lote pendiente de ingesta, ya clasificado.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub path: PathBuf,
    pub filename: String,
    pub source_type: SourceType,
}

/// Clasifica un fichero por su tipo declarado o, en su defecto, por la
/// extensión/MIME: html/htm es marcado, todo lo demás documentación.
pub fn classify_source(filename: &str, declared: Option<SourceType>) -> SourceType {
    if let Some(declared) = declared {
        return declared;
    }
    let ext = Path::new(filename)
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();
    if ext == "html" || ext == "htm" {
        return SourceType::Markup;
    }
    let mime = MimeGuess::from_path(filename).first();
    match mime {
        Some(m) if m.type_() == mime_guess::mime::TEXT && m.subtype() == mime_guess::mime::HTML => {
            SourceType::Markup
        }
        _ => SourceType::SupportDoc,
    }
}

/// Parsea el manifiesto de tipos declarados (filename → source_type).
/// Entradas desconocidas se ignoran con aviso.
pub fn parse_manifest(raw: &str) -> HashMap<String, SourceType> {
    let parsed: HashMap<String, String> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            warn!("Manifiesto de subida ilegible, se ignora: {e}");
            return HashMap::new();
        }
    };
    parsed
        .into_iter()
        .filter_map(|(filename, raw_type)| match SourceType::from_str(&raw_type) {
            Some(st) => Some((filename, st)),
            None => {
                warn!("Tipo declarado desconocido para {filename}: {raw_type}");
                None
            }
        })
        .collect()
}

/// Escanea el directorio de subidas y clasifica cada fichero del lote.
/// El orden de salida es determinista (por nombre de fichero).
pub fn scan_upload_dir(dir: &Path) -> Result<Vec<PendingFile>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let manifest_path = dir.join(MANIFEST_FILENAME);
    let declared = match fs::read_to_string(&manifest_path) {
        Ok(raw) => parse_manifest(&raw),
        Err(_) => HashMap::new(),
    };

    let mut files: Vec<PendingFile> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let filename = e.file_name().to_string_lossy().to_string();
            if filename == MANIFEST_FILENAME || filename.starts_with('.') {
                return None;
            }
            let source_type = classify_source(&filename, declared.get(&filename).copied());
            Some(PendingFile {
                path: e.path().to_path_buf(),
                filename,
                source_type,
            })
        })
        .collect();

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// Rechaza el lote completo si no cubre los dos tipos de fuente. No hay
/// ingesta parcial: este error deja intacta la construcción anterior.
pub fn validate_batch(files: &[PendingFile]) -> Result<()> {
    if files.is_empty() {
        return Err(QaAgentError::IngestionIncomplete(
            "el lote está vacío; se necesita al menos un documento de soporte y un fichero HTML"
                .into(),
        ));
    }
    if !files.iter().any(|f| f.source_type == SourceType::SupportDoc) {
        return Err(QaAgentError::IngestionIncomplete(
            "el lote no contiene ningún documento de soporte (md/txt/json/pdf)".into(),
        ));
    }
    if !files.iter().any(|f| f.source_type == SourceType::Markup) {
        return Err(QaAgentError::IngestionIncomplete(
            "el lote no contiene ningún fichero HTML de marcado".into(),
        ));
    }
    Ok(())
}

/// Construye una base de conocimiento nueva a partir del directorio de
/// subidas: trocea, calcula embeddings con concurrencia acotada y persiste
/// el resultado en Neo4j. Devuelve la instantánea lista para ser instalada.
pub async fn build_knowledge_base(
    graph: &Graph,
    llm: &LlmManager,
    cfg: &AppConfig,
    status_arc: Arc<Mutex<Status>>,
) -> Result<(Arc<KnowledgeBase>, IngestionSummary)> {
    let upload_dir = Path::new(&cfg.upload_dir);
    let files = scan_upload_dir(upload_dir)?;
    validate_batch(&files)?;

    let mut summary = IngestionSummary::default();
    summary.files_scanned = files.len() as u32;

    let mut documents: Vec<DocumentNode> = Vec::new();
    let mut pending_chunks: Vec<(usize, String)> = Vec::new(); // (doc idx, texto)
    let total_files = files.len() as f32;

    for (index, file) in files.iter().enumerate() {
        {
            let mut status = status_arc.lock().unwrap();
            status.message = format!(
                "[{}/{}] Procesando: {}...",
                index + 1,
                files.len(),
                file.filename
            );
            status.progress = (index + 1) as f32 / total_files * 0.5;
        }

        let Some(text) = read_document_text(file) else {
            summary.files_skipped += 1;
            continue;
        };

        let pieces = chunker::chunk_document(
            &text,
            file.source_type,
            cfg.chunk_max_chars,
            cfg.chunk_overlap,
        );
        if pieces.is_empty() {
            // Aviso por documento, nunca un fallo de la construcción entera.
            warn!(
                "Fichero sin texto útil tras el troceado: {}",
                file.path.display()
            );
            summary.files_skipped += 1;
            continue;
        }

        let doc_index = documents.len();
        documents.push(DocumentNode {
            id: Uuid::new_v4().to_string(),
            filename: file.filename.clone(),
            source_type: file.source_type,
            size_bytes: text.len() as i64,
            ingested_at: Utc::now().to_rfc3339(),
        });
        for piece in pieces {
            pending_chunks.push((doc_index, piece));
        }
        summary.files_ingested += 1;
    }

    // El lote pasó la validación de entrada, pero los ficheros de un tipo
    // pueden haber quedado vacíos tras el troceado.
    let coverage_ok = [SourceType::SupportDoc, SourceType::Markup]
        .iter()
        .all(|st| {
            pending_chunks
                .iter()
                .any(|(doc_idx, _)| documents[*doc_idx].source_type == *st)
        });
    if !coverage_ok {
        return Err(QaAgentError::IngestionIncomplete(
            "tras el troceado no quedan chunks de ambos tipos de fuente; revise los ficheros subidos"
                .into(),
        ));
    }

    {
        let mut status = status_arc.lock().unwrap();
        status.message = format!(
            "Generando embeddings de {} chunks...",
            pending_chunks.len()
        );
        status.progress = 0.6;
    }

    let texts: Vec<String> = pending_chunks.iter().map(|(_, t)| t.clone()).collect();
    let vectors = llm.embed_texts_batch(&texts).await?;

    // Índices de secuencia por documento, en el mismo orden del troceado.
    let mut seq_by_doc: HashMap<usize, i64> = HashMap::new();
    let mut chunks = Vec::with_capacity(pending_chunks.len());
    for ((doc_index, text), embedding) in pending_chunks.into_iter().zip(vectors) {
        let doc = &documents[doc_index];
        let seq = seq_by_doc.entry(doc_index).or_insert(0);
        chunks.push(ChunkNode {
            id: ChunkNode::make_id(&doc.filename, *seq),
            source_filename: doc.filename.clone(),
            source_type: doc.source_type,
            sequence_index: *seq,
            text,
            embedding,
        });
        *seq += 1;
    }

    summary.chunks_created = chunks.len();
    summary.support_doc_chunks = chunks
        .iter()
        .filter(|c| c.source_type == SourceType::SupportDoc)
        .count();
    summary.markup_chunks = summary.chunks_created - summary.support_doc_chunks;

    let kb = KnowledgeBase::new(
        Uuid::new_v4().to_string(),
        Utc::now().to_rfc3339(),
        chunks,
    );

    {
        let mut status = status_arc.lock().unwrap();
        status.message = "Persistiendo la construcción en Neo4j...".to_string();
        status.progress = 0.9;
    }
    vector_store::persist_build(graph, &kb, &documents).await?;

    info!("Construcción {} completada. {}", kb.build_id, summary);
    Ok((Arc::new(kb), summary))
}

/// Lee el texto de un fichero del lote. `None` significa "omitir con aviso":
/// un documento vacío o ilegible nunca tumba la construcción por sí solo.
fn read_document_text(file: &PendingFile) -> Option<String> {
    let extension = file
        .path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();

    let text = match extension.as_str() {
        "pdf" => match pdf_extract::extract_text(&file.path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "No se pudo extraer texto del PDF {}: {}. Saltando fichero.",
                    file.path.display(),
                    e
                );
                return None;
            }
        },
        "json" => match fs::read_to_string(&file.path) {
            Ok(raw) => flatten_json_text(&raw),
            Err(_) => {
                warn!("Saltando fichero no-UTF8: {}", file.path.display());
                return None;
            }
        },
        _ => match fs::read_to_string(&file.path) {
            Ok(content) => content,
            Err(_) => {
                warn!("Saltando fichero no-texto o no-UTF8: {}", file.path.display());
                return None;
            }
        },
    };

    if text.trim().is_empty() {
        warn!("Fichero vacío o sin texto útil: {}", file.path.display());
        return None;
    }
    Some(text)
}

/// Aplana un JSON a texto indentado para trocearlo como prosa; si no parsea,
/// se usa el texto en crudo tal cual.
fn flatten_json_text(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(filename: &str, source_type: SourceType) -> PendingFile {
        PendingFile {
            path: PathBuf::from(filename),
            filename: filename.to_string(),
            source_type,
        }
    }

    #[test]
    fn clasifica_html_como_marcado() {
        assert_eq!(classify_source("checkout.html", None), SourceType::Markup);
        assert_eq!(classify_source("pagina.HTM", None), SourceType::Markup);
        assert_eq!(classify_source("manual.md", None), SourceType::SupportDoc);
        assert_eq!(classify_source("datos.json", None), SourceType::SupportDoc);
        assert_eq!(classify_source("sin_extension", None), SourceType::SupportDoc);
    }

    #[test]
    fn el_tipo_declarado_gana_a_la_extension() {
        assert_eq!(
            classify_source("raro.txt", Some(SourceType::Markup)),
            SourceType::Markup
        );
        assert_eq!(
            classify_source("pagina.html", Some(SourceType::SupportDoc)),
            SourceType::SupportDoc
        );
    }

    #[test]
    fn manifiesto_valido_se_parsea() {
        let raw = r#"{"raro.txt": "markup", "manual.md": "support_doc"}"#;
        let manifest = parse_manifest(raw);
        assert_eq!(manifest.get("raro.txt"), Some(&SourceType::Markup));
        assert_eq!(manifest.get("manual.md"), Some(&SourceType::SupportDoc));
    }

    #[test]
    fn manifiesto_corrupto_se_ignora() {
        assert!(parse_manifest("esto no es json").is_empty());
        // Tipos desconocidos se descartan sin tumbar el resto.
        let manifest = parse_manifest(r#"{"a.txt": "inventado", "b.html": "markup"}"#);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("b.html"), Some(&SourceType::Markup));
    }

    #[test]
    fn lote_sin_marcado_es_incompleto() {
        let files = vec![pending("manual.md", SourceType::SupportDoc)];
        let err = validate_batch(&files).unwrap_err();
        assert_eq!(err.reason_code(), "INGESTION_INCOMPLETE");
        assert!(err.to_string().contains("HTML"));
    }

    #[test]
    fn lote_sin_documentacion_es_incompleto() {
        let files = vec![pending("checkout.html", SourceType::Markup)];
        let err = validate_batch(&files).unwrap_err();
        assert_eq!(err.reason_code(), "INGESTION_INCOMPLETE");
    }

    #[test]
    fn lote_vacio_es_incompleto() {
        let err = validate_batch(&[]).unwrap_err();
        assert_eq!(err.reason_code(), "INGESTION_INCOMPLETE");
    }

    #[test]
    fn lote_completo_pasa_la_validacion() {
        let files = vec![
            pending("manual.md", SourceType::SupportDoc),
            pending("checkout.html", SourceType::Markup),
        ];
        assert!(validate_batch(&files).is_ok());
    }

    #[test]
    fn json_se_aplana_indentado() {
        let flat = flatten_json_text(r#"{"codigo":"SAVE15","descuento":15}"#);
        assert!(flat.contains("\"codigo\""));
        assert!(flat.contains('\n'));
        // JSON inválido se conserva en crudo.
        assert_eq!(flatten_json_text("no-json"), "no-json");
    }
}
