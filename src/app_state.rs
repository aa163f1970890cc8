use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use neo4rs::Graph;
use tokio::sync::oneshot;
use crate::{config::AppConfig, llm::LlmManager, models::{KnowledgeBase, TestCase}};

/// Puntero a la instantánea activa. Los lectores clonan el `Arc` interior al
/// empezar y quedan anclados a esa construcción; una reconstrucción sólo
/// sustituye el puntero, nunca muta la instantánea.
pub type SharedKnowledgeBase = Arc<RwLock<Option<Arc<KnowledgeBase>>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub graph: Arc<Graph>,
    pub llm_manager: LlmManager,
    pub knowledge_base: SharedKnowledgeBase,
    /// Casos de prueba de la sesión, por id; se vacían en cada reconstrucción.
    pub test_cases: Arc<Mutex<HashMap<String, TestCase>>>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    /// Ancla al lector a la instantánea vigente en el instante de la llamada.
    pub fn current_kb(&self) -> Option<Arc<KnowledgeBase>> {
        self.knowledge_base.read().unwrap().clone()
    }

    /// Instala una construcción nueva. Sólo el intercambio del puntero toma
    /// el lock de escritura; el troceado/embedding ocurrió fuera. Devuelve
    /// la instantánea sustituida para que el llamante borre su persistencia.
    pub fn install_kb(&self, kb: Arc<KnowledgeBase>) -> Option<Arc<KnowledgeBase>> {
        let previous = {
            let mut guard = self.knowledge_base.write().unwrap();
            guard.replace(kb)
        };
        // Los casos de la sesión anterior citaban otra construcción.
        self.test_cases.lock().unwrap().clear();
        previous
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
