//! Modelos de dominio: documentos ingeridos, chunks con embedding,
//! instantánea de la base de conocimiento y artefactos QA generados.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tipo de fuente de un documento o chunk.
///
/// La separación es estructural: los chunks de documentación alimentan el
/// contexto narrativo y los de marcado se minan después en busca de
/// selectores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SupportDoc,
    Markup,
}

impl SourceType {
    /// Representación persistida en Neo4j y expuesta en la API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SupportDoc => "support_doc",
            Self::Markup => "markup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "support_doc" => Some(Self::SupportDoc),
            "markup" => Some(Self::Markup),
            _ => None,
        }
    }
}

/// Representa un nodo (:Document) en Neo4j.
/// Contenedor lógico de los chunks de un fichero subido.
#[derive(Debug, Clone)]
pub struct DocumentNode {
    pub id: String,
    pub filename: String,
    pub source_type: SourceType,
    pub size_bytes: i64,
    pub ingested_at: String,
}

/// Representa un nodo (:Chunk) en Neo4j y en la instantánea en memoria.
///
/// `source_filename` es una referencia al documento de origen, nunca una
/// relación de propiedad: un chunk jamás se crea desde contenido de
/// procedencia desconocida.
#[derive(Debug, Clone)]
pub struct ChunkNode {
    pub id: String,
    pub source_filename: String,
    pub source_type: SourceType,
    pub sequence_index: i64,
    pub text: String,
    pub embedding: Vec<f64>,
}

impl ChunkNode {
    /// Identidad determinista del chunk dentro de una construcción.
    pub fn make_id(filename: &str, sequence_index: i64) -> String {
        format!("{filename}::{sequence_index}")
    }
}

/// Instantánea inmutable de la base de conocimiento de una construcción.
///
/// Los lectores se quedan anclados al `Arc` que clonaron al empezar; una
/// reconstrucción nunca muta esta estructura, sólo sustituye el puntero
/// activo.
#[derive(Debug)]
pub struct KnowledgeBase {
    pub build_id: String,
    pub built_at: String,
    pub chunks: Vec<ChunkNode>,
    pub support_doc_chunks: usize,
    pub markup_chunks: usize,
}

impl KnowledgeBase {
    pub fn new(build_id: String, built_at: String, chunks: Vec<ChunkNode>) -> Self {
        let support_doc_chunks = chunks
            .iter()
            .filter(|c| c.source_type == SourceType::SupportDoc)
            .count();
        let markup_chunks = chunks.len() - support_doc_chunks;
        Self {
            build_id,
            built_at,
            chunks,
            support_doc_chunks,
            markup_chunks,
        }
    }

    /// Una base es utilizable para generación sólo si cubre ambos tipos de
    /// fuente; en caso contrario está incompleta y debe rechazar peticiones.
    pub fn is_usable(&self) -> bool {
        self.support_doc_chunks > 0 && self.markup_chunks > 0
    }

    /// Ficheros de origen presentes en esta construcción.
    pub fn filenames(&self) -> HashSet<&str> {
        self.chunks
            .iter()
            .map(|c| c.source_filename.as_str())
            .collect()
    }
}

/// Caso de prueba estructurado y ya validado.
///
/// Invariante: `grounded_in` no está vacío y cada fichero citado formó parte
/// de la evidencia pasada al prompt que lo generó.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    pub steps: Vec<String>,
    pub expected_result: String,
    pub grounded_in: Vec<String>,
}

/// Caso descartado durante la validación, con su motivo.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedCase {
    pub id: String,
    pub reason: String,
}

/// Resultado de una petición de generación de casos de prueba.
#[derive(Debug, Serialize)]
pub struct TestPlan {
    pub viewpoints: Vec<String>,
    pub test_cases: Vec<TestCase>,
    pub dropped: Vec<DroppedCase>,
}

/// Script de automatización generado para un caso de prueba concreto.
/// No se persiste más allá de la respuesta.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedScript {
    pub test_case_id: String,
    pub script_code: String,
    pub selectors: Vec<String>,
}

/// Resumen de los resultados de una construcción de la base de conocimiento.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
    pub support_doc_chunks: usize,
    pub markup_chunks: usize,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} chunks ({} de documentación, {} de marcado).",
            self.files_scanned,
            self.files_ingested,
            self.files_skipped,
            self.chunks_created,
            self.support_doc_chunks,
            self.markup_chunks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str, source_type: SourceType, idx: i64) -> ChunkNode {
        ChunkNode {
            id: ChunkNode::make_id(filename, idx),
            source_filename: filename.to_string(),
            source_type,
            sequence_index: idx,
            text: "texto".into(),
            embedding: vec![1.0, 0.0],
        }
    }

    #[test]
    fn source_type_round_trip() {
        assert_eq!(SourceType::from_str("support_doc"), Some(SourceType::SupportDoc));
        assert_eq!(SourceType::from_str("markup"), Some(SourceType::Markup));
        assert_eq!(SourceType::from_str("otro"), None);
        assert_eq!(SourceType::Markup.as_str(), "markup");
    }

    #[test]
    fn kb_sin_marcado_no_es_utilizable() {
        let kb = KnowledgeBase::new(
            "b1".into(),
            "2025-01-01T00:00:00Z".into(),
            vec![chunk("manual.md", SourceType::SupportDoc, 0)],
        );
        assert!(!kb.is_usable());
        assert_eq!(kb.support_doc_chunks, 1);
        assert_eq!(kb.markup_chunks, 0);
    }

    #[test]
    fn kb_con_ambos_tipos_es_utilizable() {
        let kb = KnowledgeBase::new(
            "b1".into(),
            "2025-01-01T00:00:00Z".into(),
            vec![
                chunk("manual.md", SourceType::SupportDoc, 0),
                chunk("checkout.html", SourceType::Markup, 0),
            ],
        );
        assert!(kb.is_usable());
        assert_eq!(kb.filenames().len(), 2);
        assert!(kb.filenames().contains("checkout.html"));
    }

    #[test]
    fn chunk_id_determinista() {
        assert_eq!(ChunkNode::make_id("checkout.html", 3), "checkout.html::3");
        assert_eq!(
            ChunkNode::make_id("checkout.html", 3),
            ChunkNode::make_id("checkout.html", 3)
        );
    }
}
