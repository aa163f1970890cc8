use crate::config::AppConfig;
use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas usadas en la persistencia:
/// :Build, :Document y :Chunk.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Build.id único
        "CREATE CONSTRAINT build_id IF NOT EXISTS
         FOR (b:Build)
         REQUIRE b.id IS UNIQUE",
        // Document.uid único (build + fichero)
        "CREATE CONSTRAINT doc_uid IF NOT EXISTS
         FOR (d:Document)
         REQUIRE d.uid IS UNIQUE",
        // Chunk.uid único (build + chunk)
        "CREATE CONSTRAINT chunk_uid IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE c.uid IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}
