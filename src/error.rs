//! Taxonomía de errores del agente QA.
//!
//! Cada variante lleva un código de razón estable que la API expone junto al
//! mensaje legible. Los fallos por ítem (grounding de un caso concreto) se
//! absorben en la generación; aquí sólo viven los fallos que llegan al
//! llamante.

use std::path::PathBuf;

/// Error de dominio para todas las operaciones del núcleo RAG.
#[derive(Debug, thiserror::Error)]
pub enum QaAgentError {
    /// El lote de ingesta no cubre los dos tipos de fuente obligatorios.
    #[error("ingesta incompleta: {0}")]
    IngestionIncomplete(String),

    /// No hay base de conocimiento activa, o la activa no es utilizable
    /// (le falta al menos un chunk de documentación o de marcado).
    #[error("base de conocimiento no disponible: {0}")]
    KnowledgeBaseNotReady(String),

    /// El servicio de embeddings falló tras agotar los reintentos.
    #[error("error del servicio de embeddings: {0}")]
    EmbeddingService(String),

    /// El servicio de completado falló tras agotar los reintentos.
    #[error("error del servicio de completado: {0}")]
    CompletionService(String),

    /// Un artefacto generado cita evidencia inexistente o ninguna.
    /// Por ítem se absorbe; sólo se propaga como parte de un detalle.
    #[error("violación de grounding: {0}")]
    GroundingViolation(String),

    /// La validación descartó todos los casos generados.
    #[error("la generación no produjo ningún resultado válido: {0}")]
    NoValidOutput(String),

    /// La recuperación no devolvió ningún chunk de marcado para la petición.
    #[error("sin evidencia de marcado: {0}")]
    NoMarkupEvidence(String),

    /// El script generado referencia selectores ausentes del marcado
    /// recuperado, incluso tras el reintento con más evidencia.
    #[error("validación de selectores fallida: {0}")]
    SelectorValidationFailed(String),

    /// El identificador de caso de prueba no existe en la sesión actual.
    #[error("caso de prueba desconocido: {0}")]
    UnknownTestCase(String),

    /// Fallo de la capa de persistencia (Neo4j).
    #[error("error de almacenamiento: {0}")]
    Storage(#[from] neo4rs::Error),

    /// Fallo de E/S sobre un fichero concreto.
    #[error("error de E/S en {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Una salida externa (completado del LLM o datos persistidos) no
    /// respeta el esquema esperado.
    #[error("error de parseo: {0}")]
    Parse(String),
}

/// Alias de conveniencia usado en todo el núcleo.
pub type Result<T> = std::result::Result<T, QaAgentError>;

impl QaAgentError {
    /// Código de razón estable, pensado para el cuerpo JSON de la API.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IngestionIncomplete(_) => "INGESTION_INCOMPLETE",
            Self::KnowledgeBaseNotReady(_) => "KNOWLEDGE_BASE_NOT_READY",
            Self::EmbeddingService(_) => "EMBEDDING_SERVICE_ERROR",
            Self::CompletionService(_) => "COMPLETION_SERVICE_ERROR",
            Self::GroundingViolation(_) => "GROUNDING_VIOLATION",
            Self::NoValidOutput(_) => "NO_VALID_OUTPUT",
            Self::NoMarkupEvidence(_) => "NO_MARKUP_EVIDENCE",
            Self::SelectorValidationFailed(_) => "SELECTOR_VALIDATION_FAILED",
            Self::UnknownTestCase(_) => "UNKNOWN_TEST_CASE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
        }
    }

    /// Crea un error de E/S asociado a una ruta.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
