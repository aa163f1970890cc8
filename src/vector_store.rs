//! Almacén vectorial: búsqueda exacta por coseno sobre la instantánea en
//! memoria, y persistencia/restauración de construcciones completas en Neo4j.
//!
//! La búsqueda opera siempre sobre una `KnowledgeBase` inmutable: eso es lo
//! que hace trivial el anclaje de los lectores a su instantánea y la
//! sustitución atómica en cada reconstrucción. Neo4j guarda el grafo
//! Build → Document → Chunk (con embeddings) para sobrevivir reinicios.

use std::cmp::Ordering;
use std::collections::HashMap;

use neo4rs::{query, Graph, Txn};
use tracing::info;

use crate::error::{QaAgentError, Result};
use crate::models::{ChunkNode, DocumentNode, KnowledgeBase, SourceType};

/// Un chunk puntuado por similitud frente a una consulta.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f64,
    pub chunk: ChunkNode,
}

/// Similitud coseno entre dos vectores de la misma dimensión.
/// `None` si las dimensiones no casan o alguna norma es cero.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Búsqueda top-k restringida a un tipo de fuente.
///
/// Orden total y determinista: puntuación descendente, y los empates se
/// resuelven por `sequence_index` ascendente y después por nombre de
/// fichero. Misma instantánea + misma consulta ⇒ mismo resultado.
pub fn search_top_chunks(
    kb: &KnowledgeBase,
    query_vec: &[f64],
    source_type: SourceType,
    top_k: usize,
) -> Vec<ScoredChunk> {
    if top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<ScoredChunk> = kb
        .chunks
        .iter()
        .filter(|c| c.source_type == source_type)
        .filter_map(|c| {
            cosine_similarity(query_vec, &c.embedding).map(|score| ScoredChunk {
                score,
                chunk: c.clone(),
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
            .then_with(|| a.chunk.source_filename.cmp(&b.chunk.source_filename))
    });
    scored.truncate(top_k);
    scored
}

// ---------------------------------------------------------------------------
// Persistencia en Neo4j
// ---------------------------------------------------------------------------

/// Persiste una construcción completa en una única transacción:
/// (:Build)-[:HAS_DOCUMENT]->(:Document)-[:HAS_CHUNK]->(:Chunk),
/// con relaciones NEXT_CHUNK entre chunks consecutivos de cada documento.
pub async fn persist_build(
    graph: &Graph,
    kb: &KnowledgeBase,
    documents: &[DocumentNode],
) -> Result<()> {
    let tx = graph.start_txn().await?;

    tx.run(
        query("MERGE (b:Build {id: $id}) SET b.built_at = $built_at")
            .param("id", kb.build_id.clone())
            .param("built_at", kb.built_at.clone()),
    )
    .await?;

    let mut doc_uids: HashMap<&str, String> = HashMap::new();
    for doc in documents {
        let uid = format!("{}/{}", kb.build_id, doc.filename);
        doc_uids.insert(doc.filename.as_str(), uid.clone());
        tx.run(
            query(
                "MERGE (d:Document {uid: $uid})
                 SET d.id = $id, d.filename = $filename, d.source_type = $source_type,
                     d.size_bytes = $size_bytes, d.ingested_at = $ingested_at
                 WITH d MATCH (b:Build {id: $build_id}) MERGE (b)-[:HAS_DOCUMENT]->(d)",
            )
            .param("uid", uid)
            .param("id", doc.id.clone())
            .param("filename", doc.filename.clone())
            .param("source_type", doc.source_type.as_str())
            .param("size_bytes", doc.size_bytes)
            .param("ingested_at", doc.ingested_at.clone())
            .param("build_id", kb.build_id.clone()),
        )
        .await?;
    }

    upsert_chunks(&tx, kb, &doc_uids).await?;

    tx.commit().await?;
    info!(
        "Construcción {} persistida: {} chunks de {} documentos.",
        kb.build_id,
        kb.chunks.len(),
        documents.len()
    );
    Ok(())
}

async fn upsert_chunks(
    tx: &Txn,
    kb: &KnowledgeBase,
    doc_uids: &HashMap<&str, String>,
) -> Result<()> {
    // NEXT_CHUNK encadena por documento, no globalmente.
    let mut prev_by_doc: HashMap<&str, String> = HashMap::new();

    for chunk in &kb.chunks {
        // Un chunk jamás se persiste con procedencia desconocida.
        let doc_uid = doc_uids
            .get(chunk.source_filename.as_str())
            .ok_or_else(|| {
                QaAgentError::GroundingViolation(format!(
                    "chunk {} referencia un documento no ingerido: {}",
                    chunk.id, chunk.source_filename
                ))
            })?;
        let uid = format!("{}/{}", kb.build_id, chunk.id);

        tx.run(
            query(
                "MERGE (c:Chunk {uid: $uid})
                 SET c.chunk_id = $chunk_id, c.source_filename = $source_filename,
                     c.source_type = $source_type, c.sequence_index = $sequence_index,
                     c.text = $text, c.embedding = $embedding
                 WITH c MATCH (d:Document {uid: $doc_uid}) MERGE (d)-[:HAS_CHUNK]->(c)",
            )
            .param("uid", uid.clone())
            .param("chunk_id", chunk.id.clone())
            .param("source_filename", chunk.source_filename.clone())
            .param("source_type", chunk.source_type.as_str())
            .param("sequence_index", chunk.sequence_index)
            .param("text", chunk.text.clone())
            .param("embedding", chunk.embedding.clone())
            .param("doc_uid", doc_uid.clone()),
        )
        .await?;

        if let Some(prev_uid) = prev_by_doc.get(chunk.source_filename.as_str()) {
            tx.run(
                query(
                    "MATCH (c1:Chunk {uid: $prev_uid}), (c2:Chunk {uid: $uid})
                     MERGE (c1)-[:NEXT_CHUNK]->(c2)",
                )
                .param("prev_uid", prev_uid.clone())
                .param("uid", uid.clone()),
            )
            .await?;
        }
        prev_by_doc.insert(chunk.source_filename.as_str(), uid);
    }

    Ok(())
}

/// Carga la última construcción persistida, si existe, reconstruyendo la
/// instantánea en memoria con la que arranca el servidor.
pub async fn load_latest_build(graph: &Graph) -> Result<Option<KnowledgeBase>> {
    let mut cursor = graph
        .execute(query(
            "MATCH (b:Build) RETURN b.id AS id, b.built_at AS built_at
             ORDER BY b.built_at DESC LIMIT 1",
        ))
        .await?;

    let Some(row) = cursor.next().await? else {
        return Ok(None);
    };
    let build_id: String = row
        .get("id")
        .ok_or_else(|| QaAgentError::Parse("falta campo 'id' en :Build".into()))?;
    let built_at: String = row
        .get("built_at")
        .ok_or_else(|| QaAgentError::Parse("falta campo 'built_at' en :Build".into()))?;

    let mut cursor = graph
        .execute(
            query(
                "MATCH (b:Build {id: $id})-[:HAS_DOCUMENT]->(:Document)-[:HAS_CHUNK]->(c:Chunk)
                 RETURN c.chunk_id AS chunk_id, c.source_filename AS source_filename,
                        c.source_type AS source_type, c.sequence_index AS sequence_index,
                        c.text AS text, c.embedding AS embedding
                 ORDER BY c.source_filename, c.sequence_index",
            )
            .param("id", build_id.clone()),
        )
        .await?;

    let mut chunks = Vec::new();
    while let Some(row) = cursor.next().await? {
        let source_type_str: String = row
            .get("source_type")
            .ok_or_else(|| QaAgentError::Parse("falta campo 'source_type' en :Chunk".into()))?;
        let source_type = SourceType::from_str(&source_type_str).ok_or_else(|| {
            QaAgentError::Parse(format!("source_type desconocido: {source_type_str}"))
        })?;

        chunks.push(ChunkNode {
            id: row
                .get("chunk_id")
                .ok_or_else(|| QaAgentError::Parse("falta campo 'chunk_id' en :Chunk".into()))?,
            source_filename: row.get("source_filename").ok_or_else(|| {
                QaAgentError::Parse("falta campo 'source_filename' en :Chunk".into())
            })?,
            source_type,
            sequence_index: row.get("sequence_index").ok_or_else(|| {
                QaAgentError::Parse("falta campo 'sequence_index' en :Chunk".into())
            })?,
            text: row
                .get("text")
                .ok_or_else(|| QaAgentError::Parse("falta campo 'text' en :Chunk".into()))?,
            embedding: row
                .get("embedding")
                .ok_or_else(|| QaAgentError::Parse("falta campo 'embedding' en :Chunk".into()))?,
        });
    }

    info!(
        "Restaurada la construcción {build_id} con {} chunks desde Neo4j.",
        chunks.len()
    );
    Ok(Some(KnowledgeBase::new(build_id, built_at, chunks)))
}

/// Borra una construcción completa. Se invoca sólo después de haber
/// sustituido la instantánea activa: los lectores anclados a la antigua
/// siguen operando en memoria sin observar el borrado.
pub async fn delete_build(graph: &Graph, build_id: &str) -> Result<()> {
    graph
        .run(
            query(
                "MATCH (b:Build {id: $id})
                 OPTIONAL MATCH (b)-[:HAS_DOCUMENT]->(d:Document)
                 OPTIONAL MATCH (d)-[:HAS_CHUNK]->(c:Chunk)
                 DETACH DELETE c, d, b",
            )
            .param("id", build_id),
        )
        .await?;
    info!("Construcción {build_id} eliminada de Neo4j.");
    Ok(())
}
