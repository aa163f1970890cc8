//! Síntesis de scripts de automatización a partir de un caso de prueba.
//!
//! Especialización del generador fundamentado: la consulta de recuperación
//! es el propio caso (título + pasos), con sesgo hacia los chunks de
//! marcado, y la validación comprueba que cada selector del script exista
//! de verdad en el marcado recuperado. Un script con un selector inventado
//! es peor que ningún script: ante un fallo de validación se reintenta una
//! vez con más evidencia de marcado y, si persiste, la petición falla.

use std::sync::OnceLock;

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use tracing::warn;

use crate::{
    config::AppConfig,
    error::{QaAgentError, Result},
    llm::LlmManager,
    models::{ChunkNode, GeneratedScript, KnowledgeBase, TestCase},
    rag::{self, Evidence},
};

/// Forma JSON que debe emitir el servicio de completado.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JsonScriptOutput {
    #[serde(default)]
    pub script_code: String,
    #[serde(default)]
    pub selectors: Vec<String>,
}

const SCRIPT_PREAMBLE: &str = r#"
Eres un desarrollador experto en Python y Selenium.
Generas scripts completos y ejecutables para casos de prueba web, usando únicamente selectores presentes en el marcado suministrado.
"#;

/// Genera un script Selenium para un caso de prueba ya aceptado.
pub async fn generate_script(
    kb: &KnowledgeBase,
    llm: &LlmManager,
    cfg: &AppConfig,
    test_case: &TestCase,
) -> Result<GeneratedScript> {
    // Un caso que cita ficheros ajenos a la construcción activa no se
    // materializa en script: su grounding pertenece a otra instantánea.
    let kb_files = kb.filenames();
    if let Some(missing) = test_case
        .grounded_in
        .iter()
        .find(|f| !kb_files.contains(f.as_str()))
    {
        return Err(QaAgentError::GroundingViolation(format!(
            "el caso {} cita {missing}, que no existe en la construcción {}",
            test_case.id, kb.build_id
        )));
    }

    // La consulta es el caso, no la petición libre original: aquí manda la
    // fidelidad de los selectores, no el contexto narrativo.
    let query = format!("{}\n{}", test_case.title, test_case.steps.join("\n"));
    let base_k_markup = cfg.k_markup.max(cfg.k_docs);

    let mut attempt: u32 = 0;
    loop {
        let k_markup = base_k_markup * (attempt as usize + 1);
        let evidence = rag::retrieve(kb, llm, &query, cfg.k_docs, k_markup).await?;
        let markup_chunks = evidence.markup_chunks();
        if markup_chunks.is_empty() {
            // Ampliar k no crea marcado donde no lo hay: terminal.
            return Err(QaAgentError::NoMarkupEvidence(format!(
                "la recuperación para el caso {} no devolvió ningún chunk de marcado",
                test_case.id
            )));
        }

        let prompt = build_script_prompt(test_case, &evidence);
        let response = llm.complete(SCRIPT_PREAMBLE, &prompt).await?;
        let (script_code, claimed) = parse_script_response(&response);
        let mined = mine_selectors(&script_code);

        match validate_selectors(&claimed, &mined, &markup_chunks) {
            Ok(selectors) => {
                return Ok(GeneratedScript {
                    test_case_id: test_case.id.clone(),
                    script_code,
                    selectors,
                });
            }
            Err(detail) if attempt == 0 => {
                warn!(
                    "Validación de selectores fallida para el caso {} ({detail}). \
                     Reintentando con k_markup ampliado.",
                    test_case.id
                );
                attempt += 1;
            }
            Err(detail) => {
                return Err(QaAgentError::SelectorValidationFailed(format!(
                    "caso {}: {detail}",
                    test_case.id
                )));
            }
        }
    }
}

fn build_script_prompt(test_case: &TestCase, evidence: &Evidence) -> String {
    let schema = serde_json::to_string_pretty(&schema_for!(JsonScriptOutput))
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"Caso de prueba:
ID: {id}
Título: {title}
Precondiciones: {preconditions}
Pasos:
{steps}
Resultado esperado: {expected}

Contexto recuperado (documentación y marcado de la página bajo prueba):
{context}

Requisitos:
1. Usa 'webdriver.Chrome()'.
2. Asume que la página está en 'file:///ruta/a/la/pagina.html' (ruta de relleno).
3. Usa esperas explícitas (WebDriverWait) en lugar de sleep siempre que sea posible.
4. Usa selectores precisos tomados del marcado del contexto (ids, names, clases); no inventes ninguno.
5. Incluye aserciones que verifiquen el resultado esperado.
6. La salida DEBE ser un único objeto JSON conforme a este esquema, con el script completo en "script_code" y en "selectors" la lista de selectores que usaste, sin explicaciones ni markdown:

{schema}"#,
        id = test_case.id,
        title = test_case.title,
        preconditions = test_case.preconditions.join("; "),
        steps = test_case.steps.join("\n"),
        expected = test_case.expected_result,
        context = evidence.context_text(),
    )
}

/// Interpreta la respuesta del LLM: idealmente el sobre JSON pedido; si no
/// parsea, el texto entero se trata como script y los selectores declarados
/// quedan vacíos (la minería sobre el código sigue aplicando).
fn parse_script_response(response: &str) -> (String, Vec<String>) {
    let cleaned = strip_fences(response);
    if let Ok(parsed) = serde_json::from_str::<JsonScriptOutput>(cleaned) {
        if !parsed.script_code.trim().is_empty() {
            let selectors = parsed
                .selectors
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            return (parsed.script_code, selectors);
        }
    }
    (cleaned.to_string(), Vec::new())
}

fn strip_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```python")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Extrae del código los localizadores `By.ID/NAME/CSS_SELECTOR` que el
/// script usa de verdad, se declaren o no en el sobre JSON.
fn mine_selectors(script: &str) -> Vec<(String, String)> {
    static SELECTOR_RE: OnceLock<Regex> = OnceLock::new();
    let re = SELECTOR_RE.get_or_init(|| {
        Regex::new(r#"By\.(ID|NAME|CSS_SELECTOR)\s*,\s*['"]([^'"]+)['"]"#).unwrap()
    });

    re.captures_iter(script)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

/// Comprueba cada selector (declarado y minado) contra el texto de los
/// chunks de marcado recuperados para ESTA petición. Devuelve la lista
/// normalizada de selectores validados, o el detalle del fallo.
fn validate_selectors(
    claimed: &[String],
    mined: &[(String, String)],
    markup_chunks: &[&ChunkNode],
) -> std::result::Result<Vec<String>, String> {
    if claimed.is_empty() && mined.is_empty() {
        return Err(
            "el script no referencia ningún selector identificable (By.ID/NAME/CSS_SELECTOR)"
                .into(),
        );
    }

    let mut normalized: Vec<String> = Vec::new();
    for sel in claimed {
        push_unique(&mut normalized, sel.clone());
    }
    for (method, sel) in mined {
        let as_css = match method.as_str() {
            "ID" => format!("#{sel}"),
            "NAME" => format!("[name=\"{sel}\"]"),
            _ => sel.clone(),
        };
        push_unique(&mut normalized, as_css);
    }

    let mut missing = Vec::new();
    for sel in &normalized {
        if !selector_present(sel, markup_chunks) {
            missing.push(sel.clone());
        }
    }

    if missing.is_empty() {
        Ok(normalized)
    } else {
        Err(format!(
            "selectores no presentes en el marcado recuperado: {}",
            missing.join(", ")
        ))
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Un selector está presente si cada uno de sus fragmentos (#id, .clase,
/// [name=...]) aparece en algún chunk de marcado; las alternativas cubren
/// tanto el selector literal como el atributo en crudo.
fn selector_present(selector: &str, markup_chunks: &[&ChunkNode]) -> bool {
    let contains = |needle: &str| markup_chunks.iter().any(|c| c.text.contains(needle));

    let fragments = selector_fragments(selector);
    if fragments.is_empty() {
        // Sin fragmentos reconocibles: etiqueta a pelo o selector complejo.
        return if selector.chars().all(|c| c.is_ascii_alphanumeric()) {
            contains(&format!("<{selector}"))
        } else {
            contains(selector)
        };
    }

    fragments.iter().all(|alternatives| {
        alternatives.iter().any(|needle| contains(needle))
    })
}

/// Fragmentos de un selector como conjunción de alternativas de búsqueda.
fn selector_fragments(selector: &str) -> Vec<Vec<String>> {
    static FRAGMENT_RE: OnceLock<Regex> = OnceLock::new();
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let fragment_re = FRAGMENT_RE
        .get_or_init(|| Regex::new(r"[#.][A-Za-z0-9_:-]+").unwrap());
    let name_re = NAME_RE
        .get_or_init(|| Regex::new(r#"\[name=['"]?([^'"\]]+)['"]?\]"#).unwrap());

    let mut fragments: Vec<Vec<String>> = Vec::new();
    for m in fragment_re.find_iter(selector) {
        let frag = m.as_str();
        match frag.as_bytes()[0] {
            b'#' => fragments.push(vec![
                frag.to_string(),
                format!("id=\"{}\"", &frag[1..]),
            ]),
            _ => fragments.push(vec![frag.to_string()]),
        }
    }
    for cap in name_re.captures_iter(selector) {
        let name = cap[1].to_string();
        fragments.push(vec![
            format!("[name=\"{name}\"]"),
            format!("name=\"{name}\""),
        ]);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    fn markup_chunk(text: &str) -> ChunkNode {
        ChunkNode {
            id: "checkout.html::0".into(),
            source_filename: "checkout.html".into(),
            source_type: SourceType::Markup,
            sequence_index: 0,
            text: text.to_string(),
            embedding: vec![1.0, 0.0],
        }
    }

    // Texto de chunk con el formato que produce el troceador de marcado.
    const CHUNK_TEXT: &str = "<input id=\"discount-code\" name=\"discount\" class=\"form-control promo\"> texto: Código de descuento | selectores: #discount-code [name=\"discount\"] .form-control .promo\n<button class=\"btn btn-primary\"> texto: Aplicar | selectores: .btn .btn-primary";

    #[test]
    fn mineria_de_selectores_del_script() {
        let script = r#"
driver.find_element(By.ID, "discount-code").send_keys("SAVE15")
wait.until(EC.element_to_be_clickable((By.CSS_SELECTOR, ".btn-primary"))).click()
driver.find_element(By.NAME, 'discount')
"#;
        let mined = mine_selectors(script);
        assert_eq!(
            mined,
            vec![
                ("ID".to_string(), "discount-code".to_string()),
                ("CSS_SELECTOR".to_string(), ".btn-primary".to_string()),
                ("NAME".to_string(), "discount".to_string()),
            ]
        );
    }

    #[test]
    fn selectores_presentes_pasan_la_validacion() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let chunks = vec![&chunk];
        let claimed = vec!["#discount-code".to_string(), ".btn-primary".to_string()];
        let mined = vec![("ID".to_string(), "discount-code".to_string())];

        let selectors = validate_selectors(&claimed, &mined, &chunks).unwrap();
        assert!(selectors.contains(&"#discount-code".to_string()));
        assert!(selectors.contains(&".btn-primary".to_string()));
        // El minado ID se normaliza a CSS y no duplica el declarado.
        assert_eq!(
            selectors
                .iter()
                .filter(|s| s.as_str() == "#discount-code")
                .count(),
            1
        );
    }

    #[test]
    fn selector_inventado_falla_con_detalle() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let chunks = vec![&chunk];
        let claimed = vec!["#discount-code".to_string(), "#no-existe".to_string()];

        let err = validate_selectors(&claimed, &[], &chunks).unwrap_err();
        assert!(err.contains("#no-existe"));
        assert!(!err.contains("#discount-code,"));
    }

    #[test]
    fn script_sin_selectores_identificables_falla() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let err = validate_selectors(&[], &[], &[&chunk]).unwrap_err();
        assert!(err.contains("ningún selector identificable"));
    }

    #[test]
    fn selector_compuesto_exige_todos_sus_fragmentos() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let chunks = vec![&chunk];
        // Ambos fragmentos existen.
        assert!(selector_present("#discount-code.form-control", &chunks));
        // Un fragmento inexistente invalida el conjunto.
        assert!(!selector_present("#discount-code .fantasma", &chunks));
    }

    #[test]
    fn selector_por_name_valida_contra_el_atributo() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let chunks = vec![&chunk];
        assert!(selector_present("[name=\"discount\"]", &chunks));
        assert!(selector_present("input[name='discount']", &chunks));
        assert!(!selector_present("[name=\"otro\"]", &chunks));
    }

    #[test]
    fn etiqueta_a_pelo_valida_por_presencia_del_tag() {
        let chunk = markup_chunk(CHUNK_TEXT);
        let chunks = vec![&chunk];
        assert!(selector_present("input", &chunks));
        assert!(selector_present("button", &chunks));
        assert!(!selector_present("iframe", &chunks));
    }

    #[test]
    fn respuesta_json_se_parsea_con_sus_selectores() {
        let response = r##"```json
{"script_code": "from selenium import webdriver\n", "selectors": ["#discount-code", " .btn "]}
```"##;
        let (code, claimed) = parse_script_response(response);
        assert!(code.starts_with("from selenium"));
        assert_eq!(claimed, vec!["#discount-code".to_string(), ".btn".to_string()]);
    }

    #[test]
    fn respuesta_en_crudo_se_trata_como_script() {
        let response = "```python\ndriver.find_element(By.ID, \"discount-code\")\n```";
        let (code, claimed) = parse_script_response(response);
        assert!(code.contains("find_element"));
        assert!(claimed.is_empty());
        assert_eq!(mine_selectors(&code).len(), 1);
    }

    #[test]
    fn el_prompt_incluye_caso_y_esquema() {
        let tc = TestCase {
            id: "TC-1".into(),
            title: "Aplicar descuento".into(),
            preconditions: vec!["Cesta con un artículo".into()],
            steps: vec!["Introducir SAVE15".into(), "Pulsar aplicar".into()],
            expected_result: "Total con 15% menos".into(),
            grounded_in: vec!["manual.md".into()],
        };
        let evidence = Evidence { items: Vec::new() };
        let prompt = build_script_prompt(&tc, &evidence);
        assert!(prompt.contains("TC-1"));
        assert!(prompt.contains("Introducir SAVE15"));
        assert!(prompt.contains("script_code"));
        assert!(prompt.contains("WebDriverWait"));
    }
}
