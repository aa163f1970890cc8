//! Recuperación de evidencia y generación fundamentada de casos de prueba.
//!
//! Flujo:
//!   1. Dos búsquedas top-k independientes (documentación y marcado) sobre
//!      la instantánea activa, para que ningún tipo de fuente muera de
//!      hambre por dominar el otro el ranking de similitud.
//!   2. Prompt con la evidencia etiquetada por fichero + petición libre.
//!   3. Validación estricta de la salida del LLM: cada caso aceptado cita
//!      ficheros que estuvieron de verdad en la evidencia de ESTE prompt.
//!      Los casos inválidos se descartan con su motivo; nunca se devuelve
//!      un artefacto fabricado como si estuviera fundamentado.

use std::collections::HashSet;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use tracing::warn;

use crate::{
    config::AppConfig,
    error::{QaAgentError, Result},
    llm::LlmManager,
    models::{ChunkNode, DroppedCase, KnowledgeBase, SourceType, TestCase, TestPlan},
    vector_store::{self, ScoredChunk},
};

/// Conjunto de evidencia ordenado y deduplicado devuelto por la recuperación.
#[derive(Debug)]
pub struct Evidence {
    pub items: Vec<ScoredChunk>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ficheros de origen presentes en esta evidencia; es el universo que
    /// un `grounded_in` aceptable puede citar.
    pub fn filenames(&self) -> HashSet<String> {
        self.items
            .iter()
            .map(|s| s.chunk.source_filename.clone())
            .collect()
    }

    /// Sólo los chunks de marcado, para la validación de selectores.
    pub fn markup_chunks(&self) -> Vec<&ChunkNode> {
        self.items
            .iter()
            .filter(|s| s.chunk.source_type == SourceType::Markup)
            .map(|s| &s.chunk)
            .collect()
    }

    /// Contexto textual para el prompt, cada bloque con su procedencia.
    pub fn context_text(&self) -> String {
        self.items
            .iter()
            .map(|s| format!("[Fuente:{}]\n{}", s.chunk.source_filename, s.chunk.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// Recuperación pura a partir de un vector de consulta ya calculado.
///
/// Dos top-k independientes por tipo de fuente, deduplicación por id de
/// chunk y orden final por similitud descendente (empates por índice de
/// secuencia y nombre de fichero). Determinista para una instantánea fija.
pub fn retrieve_with_vector(
    kb: &KnowledgeBase,
    query_vec: &[f64],
    k_docs: usize,
    k_markup: usize,
) -> Evidence {
    let doc_hits = vector_store::search_top_chunks(kb, query_vec, SourceType::SupportDoc, k_docs);
    let markup_hits =
        vector_store::search_top_chunks(kb, query_vec, SourceType::Markup, k_markup);

    let mut seen: HashSet<String> = HashSet::new();
    let mut items: Vec<ScoredChunk> = Vec::new();
    for hit in doc_hits.into_iter().chain(markup_hits) {
        if seen.insert(hit.chunk.id.clone()) {
            items.push(hit);
        }
    }

    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
            .then_with(|| a.chunk.source_filename.cmp(&b.chunk.source_filename))
    });

    Evidence { items }
}

/// Recuperación completa: embedding de la consulta + búsqueda dual.
/// Un resultado vacío para un tipo de fuente es un desenlace válido, no un
/// error; el tratamiento es del llamante.
pub async fn retrieve(
    kb: &KnowledgeBase,
    llm: &LlmManager,
    query_text: &str,
    k_docs: usize,
    k_markup: usize,
) -> Result<Evidence> {
    let query_vec = llm.embed_query(query_text).await?;
    Ok(retrieve_with_vector(kb, &query_vec, k_docs, k_markup))
}

// ---------------------------------------------------------------------------
// Formas JSON que debe emitir el servicio de completado
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JsonTestCase {
    #[serde(default)]
    pub test_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub grounded_in: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JsonTestPlan {
    #[serde(default)]
    pub test_viewpoints: Vec<String>,
    #[serde(default)]
    pub test_cases: Vec<JsonTestCase>,
}

const TEST_PLAN_PREAMBLE: &str = r#"
Eres un ingeniero experto en automatización QA.
Cada fragmento del contexto va precedido de [Fuente:<fichero>].
Sólo puedes usar la información suministrada en el contexto. No inventes funcionalidades que no estén mencionadas explícitamente.
Si el contexto no cubre la petición, devuelve listas vacías.
"#;

/// Construye el prompt de generación: evidencia etiquetada, petición libre
/// y el esquema JSON exacto que debe cumplir la respuesta.
fn build_test_plan_prompt(evidence: &Evidence, request_text: &str) -> String {
    let schema = serde_json::to_string_pretty(&schema_for!(JsonTestPlan))
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"Contexto:
{context}

Petición del usuario:
{request}

Reglas:
1. Enumera en "test_viewpoints" entre 3 y 5 perspectivas de cobertura distintas sobre el sistema bajo prueba.
2. Cada caso de "test_cases" debe incluir "test_id", "title", "preconditions", "steps", "expected_result" y "grounded_in".
3. "grounded_in" sólo puede contener nombres de fichero que aparezcan como [Fuente:...] en el contexto.
4. Incluye al menos un escenario positivo y uno negativo cuando el contexto lo permita.
5. La salida DEBE ser un único objeto JSON válido conforme a este esquema, sin explicaciones ni markdown:

{schema}"#,
        context = evidence.context_text(),
        request = request_text,
    )
}

/// Quita vallas de código markdown que el LLM añade a veces pese a las
/// instrucciones.
fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Promociona la salida del LLM al modelo de dominio, descartando con motivo
/// cada caso que no cumpla el invariante de grounding o le falten campos.
fn validate_cases(
    raw_cases: Vec<JsonTestCase>,
    allowed_sources: &HashSet<String>,
) -> (Vec<TestCase>, Vec<DroppedCase>) {
    let mut accepted = Vec::new();
    let mut dropped = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (position, raw) in raw_cases.into_iter().enumerate() {
        let label = if raw.test_id.trim().is_empty() {
            format!("caso en posición {position}")
        } else {
            raw.test_id.trim().to_string()
        };

        let drop_case = |reason: String| {
            warn!("Caso descartado ({label}): {reason}");
            DroppedCase {
                id: label.clone(),
                reason,
            }
        };

        if raw.test_id.trim().is_empty() {
            dropped.push(drop_case("falta el campo test_id".into()));
            continue;
        }
        if !seen_ids.insert(raw.test_id.trim().to_string()) {
            dropped.push(drop_case("test_id duplicado en la misma respuesta".into()));
            continue;
        }
        if raw.title.trim().is_empty() {
            dropped.push(drop_case("falta el campo title".into()));
            continue;
        }
        let steps: Vec<String> = raw
            .steps
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            dropped.push(drop_case("el caso no tiene pasos".into()));
            continue;
        }
        if raw.expected_result.trim().is_empty() {
            dropped.push(drop_case("falta el campo expected_result".into()));
            continue;
        }

        let grounded_in: Vec<String> = raw
            .grounded_in
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if grounded_in.is_empty() {
            dropped.push(drop_case(
                QaAgentError::GroundingViolation(
                    "grounded_in vacío: el caso no cita ninguna fuente".into(),
                )
                .to_string(),
            ));
            continue;
        }
        if let Some(unknown) = grounded_in.iter().find(|f| !allowed_sources.contains(*f)) {
            // La cita debe pertenecer a la evidencia de ESTE prompt, no a
            // cualquier fichero conocido: así se corta la citación plausible
            // pero no usada.
            dropped.push(drop_case(
                QaAgentError::GroundingViolation(format!(
                    "grounded_in cita una fuente fuera de la evidencia recuperada: {unknown}"
                ))
                .to_string(),
            ));
            continue;
        }

        accepted.push(TestCase {
            id: raw.test_id.trim().to_string(),
            title: raw.title.trim().to_string(),
            preconditions: raw
                .preconditions
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            steps,
            expected_result: raw.expected_result.trim().to_string(),
            grounded_in,
        });
    }

    (accepted, dropped)
}

/// Genera viewpoints y casos de prueba fundamentados para una petición.
///
/// El éxito parcial es el desenlace normal de una generación ruidosa: los
/// casos inválidos se absorben con su motivo. Sólo si la validación vacía el
/// resultado completo se devuelve `NoValidOutput`.
pub async fn generate_test_cases(
    kb: &KnowledgeBase,
    llm: &LlmManager,
    cfg: &AppConfig,
    request_text: &str,
) -> Result<TestPlan> {
    let evidence = retrieve(kb, llm, request_text, cfg.k_docs, cfg.k_markup).await?;
    if evidence.is_empty() {
        return Err(QaAgentError::NoValidOutput(
            "la recuperación no devolvió ninguna evidencia para la petición".into(),
        ));
    }

    let prompt = build_test_plan_prompt(&evidence, request_text);
    let response = llm.complete(TEST_PLAN_PREAMBLE, &prompt).await?;
    let cleaned = strip_code_fences(&response);

    let parsed: JsonTestPlan = serde_json::from_str(cleaned).map_err(|e| {
        QaAgentError::Parse(format!(
            "la respuesta del LLM no es un JSON válido conforme al esquema: {e}"
        ))
    })?;

    let allowed = evidence.filenames();
    let viewpoints: Vec<String> = parsed
        .test_viewpoints
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    let (test_cases, dropped) = validate_cases(parsed.test_cases, &allowed);

    if test_cases.is_empty() {
        return Err(QaAgentError::NoValidOutput(format!(
            "los {} casos generados fueron descartados por la validación de grounding",
            dropped.len()
        )));
    }

    Ok(TestPlan {
        viewpoints,
        test_cases,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkNode;

    fn chunk(
        filename: &str,
        source_type: SourceType,
        idx: i64,
        embedding: Vec<f64>,
    ) -> ChunkNode {
        ChunkNode {
            id: ChunkNode::make_id(filename, idx),
            source_filename: filename.to_string(),
            source_type,
            sequence_index: idx,
            text: format!("texto {idx} de {filename}"),
            embedding,
        }
    }

    fn kb(chunks: Vec<ChunkNode>) -> KnowledgeBase {
        KnowledgeBase::new("b1".into(), "2025-01-01T00:00:00Z".into(), chunks)
    }

    #[test]
    fn la_busqueda_dual_no_deja_morir_de_hambre_al_marcado() {
        // Muchos chunks de documentación casi idénticos a la consulta: en un
        // top-k fusionado coparían el ranking entero.
        let mut chunks: Vec<ChunkNode> = (0..10)
            .map(|i| chunk("manual.md", SourceType::SupportDoc, i, vec![1.0, 0.01]))
            .collect();
        chunks.push(chunk("checkout.html", SourceType::Markup, 0, vec![0.2, 1.0]));

        let evidence = retrieve_with_vector(&kb(chunks), &[1.0, 0.0], 3, 3);
        assert!(evidence
            .items
            .iter()
            .any(|s| s.chunk.source_type == SourceType::Markup));
        assert_eq!(evidence.markup_chunks().len(), 1);
    }

    #[test]
    fn la_evidencia_no_repite_chunk_ids() {
        let chunks = vec![
            chunk("manual.md", SourceType::SupportDoc, 0, vec![1.0, 0.0]),
            chunk("checkout.html", SourceType::Markup, 0, vec![1.0, 0.0]),
        ];
        let evidence = retrieve_with_vector(&kb(chunks), &[1.0, 0.0], 5, 5);
        let ids: HashSet<&str> = evidence.items.iter().map(|s| s.chunk.id.as_str()).collect();
        assert_eq!(ids.len(), evidence.items.len());
    }

    #[test]
    fn la_recuperacion_es_determinista() {
        let chunks: Vec<ChunkNode> = (0..8)
            .map(|i| {
                let st = if i % 2 == 0 {
                    SourceType::SupportDoc
                } else {
                    SourceType::Markup
                };
                chunk("f.md", st, i, vec![1.0, i as f64 / 8.0])
            })
            .collect();
        let kb = kb(chunks);
        let a = retrieve_with_vector(&kb, &[1.0, 0.4], 3, 3);
        let b = retrieve_with_vector(&kb, &[1.0, 0.4], 3, 3);
        let ids = |e: &Evidence| {
            e.items
                .iter()
                .map(|s| s.chunk.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn evidencia_vacia_por_tipo_es_valida() {
        let chunks = vec![chunk("manual.md", SourceType::SupportDoc, 0, vec![1.0, 0.0])];
        let evidence = retrieve_with_vector(&kb(chunks), &[1.0, 0.0], 3, 3);
        assert_eq!(evidence.items.len(), 1);
        assert!(evidence.markup_chunks().is_empty());
    }

    #[test]
    fn el_contexto_anota_la_procedencia() {
        let chunks = vec![chunk("manual.md", SourceType::SupportDoc, 0, vec![1.0])];
        let evidence = retrieve_with_vector(&kb(chunks), &[1.0], 3, 3);
        assert!(evidence.context_text().contains("[Fuente:manual.md]"));
    }

    #[test]
    fn strip_code_fences_variantes() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    fn raw_case(test_id: &str, grounded_in: Vec<&str>) -> JsonTestCase {
        JsonTestCase {
            test_id: test_id.into(),
            title: "Aplicar un código de descuento válido".into(),
            preconditions: vec!["La cesta tiene al menos un artículo".into()],
            steps: vec![
                "Introducir SAVE15 en el campo de descuento".into(),
                "Pulsar aplicar".into(),
            ],
            expected_result: "El total baja un 15%".into(),
            grounded_in: grounded_in.into_iter().map(String::from).collect(),
        }
    }

    fn allowed() -> HashSet<String> {
        ["manual.md".to_string(), "checkout.html".to_string()]
            .into_iter()
            .collect()
    }

    #[test]
    fn caso_valido_se_acepta() {
        let (accepted, dropped) =
            validate_cases(vec![raw_case("TC-1", vec!["manual.md"])], &allowed());
        assert_eq!(accepted.len(), 1);
        assert!(dropped.is_empty());
        assert_eq!(accepted[0].id, "TC-1");
        assert_eq!(accepted[0].grounded_in, vec!["manual.md".to_string()]);
    }

    #[test]
    fn caso_sin_grounding_se_descarta() {
        let (accepted, dropped) = validate_cases(vec![raw_case("TC-1", vec![])], &allowed());
        assert!(accepted.is_empty());
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].reason.contains("grounded_in vacío"));
    }

    #[test]
    fn caso_que_cita_fuente_no_recuperada_se_descarta() {
        // "plausible.md" existe como nombre creíble pero no estuvo en la
        // evidencia de este prompt.
        let (accepted, dropped) =
            validate_cases(vec![raw_case("TC-1", vec!["plausible.md"])], &allowed());
        assert!(accepted.is_empty());
        assert!(dropped[0].reason.contains("plausible.md"));
    }

    #[test]
    fn caso_sin_pasos_o_sin_id_se_descarta() {
        let mut sin_pasos = raw_case("TC-1", vec!["manual.md"]);
        sin_pasos.steps.clear();
        let mut sin_id = raw_case("", vec!["manual.md"]);
        sin_id.test_id = "  ".into();

        let (accepted, dropped) = validate_cases(vec![sin_pasos, sin_id], &allowed());
        assert!(accepted.is_empty());
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn ids_duplicados_se_descartan() {
        let (accepted, dropped) = validate_cases(
            vec![
                raw_case("TC-1", vec!["manual.md"]),
                raw_case("TC-1", vec!["checkout.html"]),
            ],
            &allowed(),
        );
        assert_eq!(accepted.len(), 1);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].reason.contains("duplicado"));
    }

    #[test]
    fn exito_parcial_conserva_los_validos() {
        let (accepted, dropped) = validate_cases(
            vec![
                raw_case("TC-1", vec!["manual.md"]),
                raw_case("TC-2", vec!["inventado.md"]),
                raw_case("TC-3", vec!["checkout.html", "manual.md"]),
            ],
            &allowed(),
        );
        assert_eq!(accepted.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, "TC-2");
    }

    #[test]
    fn el_plan_json_se_deserializa() {
        let raw = r#"{
            "test_viewpoints": ["Valores límite del código de descuento"],
            "test_cases": [{
                "test_id": "TC-1",
                "title": "Código válido",
                "preconditions": [],
                "steps": ["Introducir SAVE15"],
                "expected_result": "Descuento del 15%",
                "grounded_in": ["manual.md"]
            }]
        }"#;
        let plan: JsonTestPlan = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.test_viewpoints.len(), 1);
        assert_eq!(plan.test_cases[0].test_id, "TC-1");
    }

    #[test]
    fn el_prompt_incluye_contexto_y_esquema() {
        let chunks = vec![chunk("manual.md", SourceType::SupportDoc, 0, vec![1.0])];
        let evidence = retrieve_with_vector(&kb(chunks), &[1.0], 3, 3);
        let prompt = build_test_plan_prompt(&evidence, "casos para el descuento");
        assert!(prompt.contains("[Fuente:manual.md]"));
        assert!(prompt.contains("casos para el descuento"));
        assert!(prompt.contains("test_viewpoints"));
        assert!(prompt.contains("grounded_in"));
    }
}
