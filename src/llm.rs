//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.
//!
//! Todas las llamadas salientes van envueltas en timeout y reintentos
//! acotados con backoff: agotar los reintentos produce un fallo tipado,
//! nunca un resultado vacío silencioso.

use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::warn;

use crate::config::{AppConfig, LlmProvider};
use crate::error::{QaAgentError, Result};

/// Tamaño de los sub-lotes enviados al servicio de embeddings.
const EMBED_BATCH_SIZE: usize = 32;

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
    timeout: Duration,
    max_retries: u32,
    embed_concurrency: usize,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            timeout: Duration::from_secs(cfg.llm_timeout_secs),
            max_retries: cfg.llm_max_retries,
            embed_concurrency: cfg.embed_concurrency,
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos, en sub-lotes y con un
    /// tope de peticiones simultáneas al servicio externo. El orden de
    /// salida coincide con el de entrada. Un fallo en cualquier sub-lote
    /// invalida el lote completo: no hay índice parcial.
    pub async fn embed_texts_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<Vec<String>> = texts
            .chunks(EMBED_BATCH_SIZE)
            .map(|b| b.to_vec())
            .collect();

        // `buffered` preserva el orden de los sub-lotes aunque se resuelvan
        // fuera de orden.
        let results: Vec<Vec<Vec<f64>>> = stream::iter(batches)
            .map(|batch| async move { self.embed_batch_with_retries(batch).await })
            .buffered(self.embed_concurrency)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    /// Embedding de una consulta de recuperación.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f64>> {
        let mut vectors = self
            .embed_batch_with_retries(vec![text.to_string()])
            .await?;
        vectors.pop().ok_or_else(|| {
            QaAgentError::EmbeddingService(
                "el servicio no devolvió ningún vector para la consulta".into(),
            )
        })
    }

    async fn embed_batch_with_retries(&self, batch: Vec<String>) -> Result<Vec<Vec<f64>>> {
        let mut attempt: u32 = 0;
        loop {
            let outcome =
                tokio::time::timeout(self.timeout, self.embed_batch_once(&batch)).await;
            let err_detail = match outcome {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timeout tras {}s", self.timeout.as_secs()),
            };

            if attempt >= self.max_retries {
                return Err(QaAgentError::EmbeddingService(format!(
                    "agotados {} reintentos: {err_detail}",
                    self.max_retries
                )));
            }
            attempt += 1;
            let delay = backoff_delay(attempt);
            warn!(
                "Fallo transitorio de embeddings (intento {attempt}): {err_detail}. Reintentando en {delay:?}."
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn embed_batch_once(&self, batch: &[String]) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(batch).await,
            ref other => Err(QaAgentError::EmbeddingService(format!(
                "proveedor LLM {other:?} aún no implementado para embeddings"
            ))),
        }
    }

    async fn embed_with_openai(&self, batch: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;

        // Cliente OpenAI de Rig
        let client = openai::Client::from_env();

        // Modelo de embeddings: config o default
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model
            .embed_texts(batch.to_vec())
            .await
            .map_err(|e| QaAgentError::EmbeddingService(e.to_string()))?;

        if embeddings.len() != batch.len() {
            return Err(QaAgentError::EmbeddingService(format!(
                "número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                batch.len()
            )));
        }

        let mut vectors = Vec::with_capacity(embeddings.len());
        for emb in &embeddings {
            // Un vector degenerado es un fallo del servicio, no un dato.
            if is_degenerate(&emb.vec) {
                return Err(QaAgentError::EmbeddingService(
                    "el servicio devolvió un vector degenerado (todo ceros)".into(),
                ));
            }
            vectors.push(emb.vec.clone());
        }

        Ok(vectors)
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    /// Lanza una petición de completado con un preámbulo de sistema y un
    /// prompt de usuario. La salida se trata como texto no confiable: la
    /// validación estructural es responsabilidad del llamante.
    pub async fn complete(&self, preamble: &str, prompt: &str) -> Result<String> {
        let mut attempt: u32 = 0;
        loop {
            let outcome =
                tokio::time::timeout(self.timeout, self.complete_once(preamble, prompt)).await;
            let err_detail = match outcome {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timeout tras {}s", self.timeout.as_secs()),
            };

            if attempt >= self.max_retries {
                return Err(QaAgentError::CompletionService(format!(
                    "agotados {} reintentos: {err_detail}",
                    self.max_retries
                )));
            }
            attempt += 1;
            let delay = backoff_delay(attempt);
            warn!(
                "Fallo transitorio de completado (intento {attempt}): {err_detail}. Reintentando en {delay:?}."
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn complete_once(&self, preamble: &str, prompt: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_with_openai(preamble, prompt).await,
            ref other => Err(QaAgentError::CompletionService(format!(
                "proveedor LLM {other:?} aún no implementado para chat"
            ))),
        }
    }

    async fn complete_with_openai(&self, preamble: &str, prompt: &str) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;

        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client.agent(model_name).preamble(preamble).build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| QaAgentError::CompletionService(e.to_string()))
    }
}

/// Backoff exponencial con base de 250 ms.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1u64 << attempt.min(6)))
}

fn is_degenerate(vector: &[f64]) -> bool {
    vector.is_empty() || vector.iter().all(|v| *v == 0.0)
}
