//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + RAG).

use std::env;
use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    /// Directorio donde se depositan los ficheros subidos de cada lote.
    pub upload_dir: String,

    /// Tamaño máximo de un chunk en caracteres y solape entre adyacentes.
    pub chunk_max_chars: usize,
    pub chunk_overlap: usize,

    /// Top-k por tipo de fuente en la recuperación.
    pub k_docs: usize,
    pub k_markup: usize,

    /// Contrato con los servicios externos: timeout por llamada,
    /// reintentos acotados y tope de embeddings simultáneos.
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub embed_concurrency: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let upload_dir =
            env::var("UPLOAD_DIR").unwrap_or_else(|_| "data/uploads".to_string());

        let chunk_max_chars = parse_env_usize("CHUNK_MAX_CHARS", 1200)?;
        let chunk_overlap = parse_env_usize("CHUNK_OVERLAP", 150)?;
        if chunk_overlap >= chunk_max_chars {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) debe ser menor que CHUNK_MAX_CHARS ({chunk_max_chars})"
            ));
        }

        let k_docs = parse_env_usize("RETRIEVAL_K_DOCS", 4)?;
        let k_markup = parse_env_usize("RETRIEVAL_K_MARKUP", 4)?;

        let llm_timeout_secs = parse_env_usize("LLM_TIMEOUT_SECS", 30)? as u64;
        let llm_max_retries = parse_env_usize("LLM_MAX_RETRIES", 2)? as u32;
        let embed_concurrency = parse_env_usize("EMBED_CONCURRENCY", 4)?.max(1);

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            upload_dir,
            chunk_max_chars,
            chunk_overlap,
            k_docs,
            k_markup,
            llm_timeout_secs,
            llm_max_retries,
            embed_concurrency,
        })
    }
}

fn parse_env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<usize>()
            .map_err(|_| anyhow!("{key} no es un entero válido: {raw}")),
        Err(_) => Ok(default),
    }
}
