//! Troceado determinista de documentos en chunks recuperables.
//!
//! Dos estrategias según el tipo de fuente:
//!   - Prosa (md/txt/json/pdf ya extraído): acumulación de párrafos hasta un
//!     máximo de caracteres, con solape entre chunks adyacentes para que un
//!     hecho partido por la frontera siga siendo recuperable.
//!   - Marcado (HTML): una línea de localizador por elemento relevante, con
//!     etiqueta, atributos id/class/name, texto cercano y los selectores
//!     equivalentes. Estos chunks se minan después en busca de selectores,
//!     no de significado narrativo.

use scraper::{ElementRef, Html};

use crate::models::SourceType;

/// Etiquetas que nunca aportan localizadores útiles.
const IGNORED_TAGS: &[&str] = &[
    "html", "head", "meta", "link", "title", "script", "style", "noscript",
];

/// Etiquetas interesantes incluso sin id/class/name.
const INTERACTIVE_TAGS: &[&str] = &[
    "input", "button", "select", "textarea", "a", "form", "label", "h1", "h2",
    "h3", "h4", "h5", "h6",
];

/// Trocea un documento según su tipo de fuente. Determinista: mismo texto,
/// mismas fronteras y mismos índices de secuencia en cada llamada.
pub fn chunk_document(
    text: &str,
    source_type: SourceType,
    max_chars: usize,
    overlap: usize,
) -> Vec<String> {
    match source_type {
        SourceType::SupportDoc => chunk_prose(text, max_chars, overlap),
        SourceType::Markup => chunk_markup(text, max_chars),
    }
}

/// Troceado de prosa por párrafos, con tope de tamaño y solape mínimo.
pub fn chunk_prose(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    // Presupuesto de contenido por pieza: deja sitio para el solape que se
    // antepone al abrir el siguiente chunk.
    let budget = max_chars.saturating_sub(overlap + 2).max(1);

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // `fresh` marca si `current` contiene contenido nuevo o sólo el solape
    // heredado del chunk anterior.
    let mut fresh = false;

    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());

    for paragraph in paragraphs {
        for piece in split_long_text(paragraph, budget) {
            if !current.is_empty() && current.len() + piece.len() + 2 > max_chars {
                if fresh {
                    chunks.push(current.trim().to_string());
                }
                current = tail_on_char_boundary(&current, overlap).to_string();
                fresh = false;
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
            fresh = true;
        }
    }

    if fresh && !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

/// Troceado de marcado: una línea de localizador por elemento relevante,
/// agrupadas en chunks sin partir nunca una línea.
pub fn chunk_markup(html: &str, max_chars: usize) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut lines = Vec::new();

    for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        let tag = el.value().name();
        if IGNORED_TAGS.contains(&tag) {
            continue;
        }

        let id = el.value().attr("id").map(str::trim).filter(|s| !s.is_empty());
        let name = el.value().attr("name").map(str::trim).filter(|s| !s.is_empty());
        let classes: Vec<&str> = el
            .value()
            .attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();

        if id.is_none() && name.is_none() && classes.is_empty() && !INTERACTIVE_TAGS.contains(&tag)
        {
            continue;
        }

        lines.push(locator_line(&el, tag, id, name, &classes));
    }

    group_lines(lines, max_chars)
}

/// Línea de localizador de un elemento: atributos en crudo, texto cercano y
/// los selectores equivalentes, para que la validación posterior funcione
/// por contención de cadenas sobre el texto del chunk.
fn locator_line(
    el: &ElementRef,
    tag: &str,
    id: Option<&str>,
    name: Option<&str>,
    classes: &[&str],
) -> String {
    let mut line = format!("<{tag}");
    if let Some(id) = id {
        line.push_str(&format!(" id=\"{id}\""));
    }
    if let Some(name) = name {
        line.push_str(&format!(" name=\"{name}\""));
    }
    if !classes.is_empty() {
        line.push_str(&format!(" class=\"{}\"", classes.join(" ")));
    }
    line.push('>');

    let nearby = nearby_text(el);
    if !nearby.is_empty() {
        line.push_str(&format!(" texto: {nearby}"));
    }

    let mut selectors = Vec::new();
    if let Some(id) = id {
        selectors.push(format!("#{id}"));
    }
    if let Some(name) = name {
        selectors.push(format!("[name=\"{name}\"]"));
    }
    for class in classes {
        selectors.push(format!(".{class}"));
    }
    if !selectors.is_empty() {
        line.push_str(&format!(" | selectores: {}", selectors.join(" ")));
    }

    line
}

/// Texto cercano de un elemento: su contenido textual o, para campos de
/// formulario, placeholder/value. Colapsado y truncado.
fn nearby_text(el: &ElementRef) -> String {
    let mut text: String = el
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if text.is_empty() {
        for attr in ["placeholder", "value", "aria-label", "alt"] {
            if let Some(v) = el.value().attr(attr) {
                let v = v.trim();
                if !v.is_empty() {
                    text = v.to_string();
                    break;
                }
            }
        }
    }

    truncate_on_char_boundary(&text, 80)
}

/// Agrupa líneas en chunks de hasta `max_chars` sin partir ninguna línea;
/// una línea que por sí sola excede el máximo forma su propio chunk.
fn group_lines(lines: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parte un texto más largo que `budget` en piezas, prefiriendo cortar en
/// espacios para no partir palabras.
fn split_long_text(text: &str, budget: usize) -> Vec<String> {
    let budget = budget.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.len() <= budget {
            pieces.push(rest.to_string());
            break;
        }
        let mut cut = budget;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // El primer carácter es más ancho que el presupuesto.
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        } else if let Some(ws) = rest[..cut].rfind(char::is_whitespace) {
            if ws > budget / 2 {
                cut = ws;
            }
        }
        let piece = rest[..cut].trim_end();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    pieces
}

/// Últimos `n` bytes de `s`, ajustados a frontera de carácter.
fn tail_on_char_boundary(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut idx = s.len() - n;
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    &s[idx..]
}

fn truncate_on_char_boundary(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let mut idx = n;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s[..idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 200;
    const OVERLAP: usize = 40;

    #[test]
    fn prosa_vacia_produce_cero_chunks() {
        assert!(chunk_prose("", MAX, OVERLAP).is_empty());
        assert!(chunk_prose("   \n\n  \n\n ", MAX, OVERLAP).is_empty());
    }

    #[test]
    fn prosa_corta_en_un_solo_chunk() {
        let chunks = chunk_prose("Un párrafo breve.", MAX, OVERLAP);
        assert_eq!(chunks, vec!["Un párrafo breve.".to_string()]);
    }

    #[test]
    fn prosa_respeta_el_tamano_maximo() {
        let text = (0..30)
            .map(|i| format!("Párrafo número {i} con algo de contenido útil."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_prose(&text, MAX, OVERLAP);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX, "chunk de {} chars", chunk.len());
        }
    }

    #[test]
    fn prosa_es_determinista() {
        let text = (0..20)
            .map(|i| format!("El código SAVE{i} aplica un descuento del {i}%."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let a = chunk_prose(&text, MAX, OVERLAP);
        let b = chunk_prose(&text, MAX, OVERLAP);
        assert_eq!(a, b);
    }

    #[test]
    fn chunks_adyacentes_comparten_solape() {
        let text = (0..30)
            .map(|i| format!("Dato importante número {i} sobre los descuentos."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_prose(&text, MAX, OVERLAP);
        assert!(chunks.len() > 1);
        // El segundo chunk arranca con la cola del primero.
        let tail = tail_on_char_boundary(&chunks[0], OVERLAP);
        assert!(
            chunks[1].starts_with(tail.trim()),
            "esperaba que {:?} empezase por {:?}",
            &chunks[1][..chunks[1].len().min(60)],
            tail
        );
    }

    #[test]
    fn parrafo_gigante_se_parte_sin_superar_el_maximo() {
        let text = "palabra ".repeat(400);
        let chunks = chunk_prose(&text, MAX, OVERLAP);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX);
        }
    }

    #[test]
    fn marcado_conserva_id_clase_y_selectores() {
        let html = r#"
            <html><body>
              <form id="checkout-form">
                <label for="discount-code">Código de descuento</label>
                <input id="discount-code" name="discount" class="form-control promo">
                <button class="btn btn-primary" type="submit">Aplicar</button>
              </form>
            </body></html>
        "#;
        let chunks = chunk_markup(html, 1200);
        assert!(!chunks.is_empty());
        let joined = chunks.join("\n");
        assert!(joined.contains(r#"id="discount-code""#));
        assert!(joined.contains("#discount-code"));
        assert!(joined.contains(r#"[name="discount"]"#));
        assert!(joined.contains(".form-control"));
        assert!(joined.contains(".btn-primary"));
        assert!(joined.contains("#checkout-form"));
        // Texto cercano del label.
        assert!(joined.contains("Código de descuento"));
    }

    #[test]
    fn marcado_ignora_script_y_style() {
        let html = r##"<html><head><style>.oculto{}</style></head>
            <body><script>var x = "#fantasma";</script>
            <input id="real"></body></html>"##;
        let joined = chunk_markup(html, 1200).join("\n");
        assert!(joined.contains("#real"));
        assert!(!joined.contains("#fantasma"));
        assert!(!joined.contains(".oculto"));
    }

    #[test]
    fn marcado_sin_elementos_produce_cero_chunks() {
        assert!(chunk_markup("", 1200).is_empty());
        assert!(chunk_markup("texto plano sin etiquetas", 1200).is_empty());
    }

    #[test]
    fn marcado_es_determinista() {
        let html = r#"<div class="a"><input id="x"><input id="y"></div>"#;
        assert_eq!(chunk_markup(html, 1200), chunk_markup(html, 1200));
    }

    #[test]
    fn marcado_agrupa_sin_partir_lineas() {
        let html: String = (0..40)
            .map(|i| format!(r#"<input id="campo-{i}" class="form-control">"#))
            .collect();
        let chunks = chunk_markup(&format!("<body>{html}</body>"), 160);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            for line in chunk.lines() {
                assert!(line.starts_with("<input"), "línea partida: {line:?}");
            }
        }
    }

    #[test]
    fn dispatch_por_tipo_de_fuente() {
        let prose = chunk_document("hola\n\nmundo", SourceType::SupportDoc, MAX, OVERLAP);
        assert_eq!(prose.len(), 1);
        let markup = chunk_document(
            r#"<input id="x">"#,
            SourceType::Markup,
            MAX,
            OVERLAP,
        );
        assert_eq!(markup.len(), 1);
        assert!(markup[0].contains("#x"));
    }
}
