use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::AnalysisError;
use crate::llm::types::AnalysisResult;

const MALFORMED_SNIPPET_CHARS: usize = 100;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?").expect("valid code fence pattern"));

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

impl GeminiResponse {
    pub fn candidate_count(&self) -> usize {
        self.candidates.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// A 200 body that is not a generateContent envelope counts as empty.
pub fn parse_envelope(body: &str) -> Result<GeminiResponse, AnalysisError> {
    serde_json::from_str::<GeminiResponse>(body).map_err(|err| {
        debug!(target: "llm.gemini", "Unreadable Gemini envelope: {}", err);
        AnalysisError::EmptyResponse
    })
}

/// Text of the first candidate. Missing, blank, or the literal `undefined`
/// is an empty response.
pub fn extract_text(envelope: &GeminiResponse) -> Result<String, AnalysisError> {
    let text = envelope
        .candidates
        .as_deref()
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.content.as_ref())
        .and_then(|content| content.parts.as_deref())
        .map(|parts| {
            parts
                .iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default();

    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "undefined" {
        return Err(AnalysisError::EmptyResponse);
    }
    Ok(trimmed.to_string())
}

/// Drops Markdown fences and any prose before the first `{`.
pub fn strip_code_fences(text: &str) -> String {
    let unfenced = CODE_FENCE.replace_all(text, "");
    let trimmed = unfenced.trim();
    match trimmed.find('{') {
        Some(start) if start > 0 => trimmed[start..].to_string(),
        _ => trimmed.to_string(),
    }
}

/// The text up to the last `}` when prose follows it, e.g. a closing
/// remark after the fenced block.
fn without_trailing_prose(text: &str) -> Option<&str> {
    let end = text.rfind('}')?;
    let (document, rest) = text.split_at(end + 1);
    (!rest.trim().is_empty()).then_some(document)
}

pub fn parse_analysis(text: &str) -> Result<AnalysisResult, AnalysisError> {
    let cleaned = strip_code_fences(text);
    if let Some(result) = try_parse_analysis(&cleaned) {
        return Ok(result);
    }

    let document = without_trailing_prose(&cleaned);
    if let Some(result) = document.and_then(try_parse_analysis) {
        debug!(target: "llm.gemini", "Dropped prose after the analysis JSON");
        return Ok(result);
    }

    let repaired = std::iter::once(cleaned.as_str())
        .chain(document)
        .find_map(|candidate| try_parse_analysis(&repair_json(candidate)));
    if let Some(result) = repaired {
        debug!(target: "llm.gemini", "Recovered analysis JSON through repair");
        return Ok(result);
    }

    Err(AnalysisError::MalformedResult {
        snippet: cleaned.chars().take(MALFORMED_SNIPPET_CHARS).collect(),
    })
}

fn try_parse_analysis(text: &str) -> Option<AnalysisResult> {
    let value = serde_json::from_str::<Value>(text).ok()?;
    analysis_from_value(&value)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|item| !item.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn analysis_from_value(value: &Value) -> Option<AnalysisResult> {
    let result = AnalysisResult {
        soil_type: value.get("soilType")?.as_str()?.to_string(),
        characteristics: string_list(value.get("characteristics")),
        recommendations: string_list(value.get("recommendations")),
    };
    result.is_complete().then_some(result)
}

/// One best-effort pass over model output that failed to parse: close a
/// truncated document, drop newline escapes, escape stray inner quotes.
pub fn repair_json(text: &str) -> String {
    let mut repaired = text.trim().to_string();
    if !repaired.ends_with('}') {
        repaired = close_truncated(&repaired);
    }
    repaired = remove_newline_escapes(&repaired);
    escape_inner_quotes(&repaired)
}

struct StructureScan {
    open_brackets: Vec<char>,
    open_string_start: Option<usize>,
    last_string_start: Option<usize>,
}

fn scan_structure(text: &str) -> StructureScan {
    let mut open_brackets = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_start = None;
    let mut last_string_start = None;

    for (index, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                last_string_start = string_start.take();
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                string_start = Some(index);
            }
            '{' | '[' => open_brackets.push(ch),
            '}' | ']' => {
                open_brackets.pop();
            }
            _ => {}
        }
    }

    StructureScan {
        open_brackets,
        open_string_start: if in_string { string_start } else { None },
        last_string_start,
    }
}

fn trim_dangling_tokens(body: &mut String) {
    loop {
        let trimmed_len = body.trim_end().len();
        body.truncate(trimmed_len);

        if body.ends_with(',') {
            body.pop();
            continue;
        }
        if body.ends_with(':') {
            body.pop();
            let trimmed_len = body.trim_end().len();
            body.truncate(trimmed_len);
            // The key whose value was cut off.
            if body.ends_with('"') {
                let key_end = body.len() - 1;
                if let Some(key_start) = body[..key_end].rfind('"') {
                    body.truncate(key_start);
                }
            }
            continue;
        }
        if body.ends_with('"') && drop_trailing_key(body) {
            continue;
        }
        break;
    }
}

/// Removes a complete string sitting in key position at the end of `body`,
/// i.e. a key that never got its colon.
fn drop_trailing_key(body: &mut String) -> bool {
    let scan = scan_structure(body);
    let (Some(start), Some('{')) = (scan.last_string_start, scan.open_brackets.last()) else {
        return false;
    };
    let before = body[..start].trim_end();
    if before.ends_with(',') || before.ends_with('{') {
        body.truncate(start);
        return true;
    }
    false
}

fn close_truncated(text: &str) -> String {
    let mut body = text.to_string();
    if let Some(start) = scan_structure(&body).open_string_start {
        body.truncate(start);
    }
    trim_dangling_tokens(&mut body);

    let closers: String = scan_structure(&body)
        .open_brackets
        .iter()
        .rev()
        .map(|bracket| if *bracket == '{' { '}' } else { ']' })
        .collect();
    body.push_str(&closers);
    body
}

fn remove_newline_escapes(text: &str) -> String {
    text.replace("\\n", " ").replace(['\r', '\n'], " ")
}

fn closes_string(rest: &[char]) -> bool {
    match rest.iter().find(|ch| !ch.is_whitespace()) {
        None => true,
        Some(ch) => matches!(ch, ',' | ':' | ']' | '}'),
    }
}

fn escape_inner_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for (index, &ch) in chars.iter().enumerate() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' if closes_string(&chars[index + 1..]) => {
                in_string = false;
                out.push(ch);
            }
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENOSO: &str = r#"{"soilType":"Arenoso","characteristics":["seco","solto","claro","arenoso"],"recommendations":["irrigar frequentemente","adubar","adicionar matéria orgânica"]}"#;

    fn envelope(text: &str) -> GeminiResponse {
        let body = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        });
        parse_envelope(&body.to_string()).unwrap()
    }

    #[test]
    fn extracts_first_candidate_text() {
        assert_eq!(extract_text(&envelope("  olá  ")).unwrap(), "olá");
    }

    #[test]
    fn undefined_and_blank_text_are_empty_responses() {
        assert_eq!(
            extract_text(&envelope("undefined")),
            Err(AnalysisError::EmptyResponse)
        );
        assert_eq!(extract_text(&envelope("  ")), Err(AnalysisError::EmptyResponse));
        let no_candidates = parse_envelope(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(extract_text(&no_candidates), Err(AnalysisError::EmptyResponse));
    }

    #[test]
    fn skips_thought_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"thinking...","thought":true},{"text":"resposta"}]}}]}"#;
        let envelope = parse_envelope(body).unwrap();
        assert_eq!(extract_text(&envelope).unwrap(), "resposta");
    }

    #[test]
    fn non_envelope_body_is_empty_response() {
        assert_eq!(
            parse_envelope("<html>oops</html>").unwrap_err(),
            AnalysisError::EmptyResponse
        );
    }

    #[test]
    fn parses_well_formed_json_unchanged() {
        let result = parse_analysis(ARENOSO).unwrap();
        assert_eq!(result.soil_type, "Arenoso");
        assert_eq!(result.characteristics, vec!["seco", "solto", "claro", "arenoso"]);
        assert_eq!(
            result.recommendations,
            vec!["irrigar frequentemente", "adubar", "adicionar matéria orgânica"]
        );
    }

    #[test]
    fn repair_is_a_no_op_on_valid_json() {
        let direct = parse_analysis(ARENOSO).unwrap();
        let repaired = try_parse_analysis(&repair_json(ARENOSO)).unwrap();
        assert_eq!(direct, repaired);
    }

    #[test]
    fn strips_markdown_fences_and_preamble() {
        let fenced = format!("Aqui está:\n```json\n{ARENOSO}\n```");
        assert_eq!(parse_analysis(&fenced).unwrap().soil_type, "Arenoso");
    }

    #[test]
    fn recovers_output_truncated_after_a_complete_entry() {
        let text = r#"{"soilType":"Argiloso","characteristics":["a","b"],"recommendations":["x","y""#;
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.soil_type, "Argiloso");
        assert_eq!(result.characteristics, vec!["a", "b"]);
        assert!(result.recommendations.contains(&"x".to_string()));
    }

    #[test]
    fn recovers_output_truncated_inside_a_string() {
        let text = r#"{"soilType":"Argiloso","characteristics":["a","b"],"recommendations":["x","adicionar cal"#;
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.recommendations, vec!["x"]);
    }

    #[test]
    fn drops_a_key_whose_value_was_cut_off() {
        let text = r#"{"characteristics":["a"],"recommendations":["x"],"soilType":"Humoso","notes":"#;
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.soil_type, "Humoso");
    }

    #[test]
    fn drops_a_trailing_key_without_colon() {
        let text = r#"{"soilType":"Argiloso","characteristics":["a","b"],"recommendations":["x","y"],"observacoes""#;
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.soil_type, "Argiloso");
        assert_eq!(result.recommendations, vec!["x", "y"]);
    }

    #[test]
    fn keeps_trailing_value_strings_inside_arrays() {
        let repaired = repair_json(r#"{"soilType":"Argiloso","characteristics":["a","b""#);
        assert_eq!(repaired, r#"{"soilType":"Argiloso","characteristics":["a","b"]}"#);
    }

    #[test]
    fn ignores_prose_after_the_fenced_block() {
        let text = format!("```json\n{ARENOSO}\n```\nEspero ter ajudado!");
        let result = parse_analysis(&text).unwrap();
        assert_eq!(result.soil_type, "Arenoso");
        assert_eq!(result.recommendations.len(), 3);
    }

    #[test]
    fn escapes_unescaped_inner_quotes() {
        let text = r#"{"soilType":"Argiloso","characteristics":["solo "pesado" e úmido","b"],"recommendations":["x"]}"#;
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.characteristics[0], r#"solo "pesado" e úmido"#);
    }

    #[test]
    fn replaces_raw_newlines_inside_strings() {
        let text = "{\"soilType\":\"Siltoso\",\"characteristics\":[\"fino\nmacio\"],\"recommendations\":[\"x\"]}";
        let result = parse_analysis(text).unwrap();
        assert_eq!(result.characteristics, vec!["fino macio"]);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = parse_analysis(r#"{"soilType":"Arenoso","characteristics":[]}"#).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedResult { .. }));
    }

    #[test]
    fn malformed_error_carries_a_short_snippet() {
        let text = format!("not json at all {}", "x".repeat(300));
        match parse_analysis(&text).unwrap_err() {
            AnalysisError::MalformedResult { snippet } => {
                assert_eq!(snippet.chars().count(), MALFORMED_SNIPPET_CHARS);
                assert!(snippet.starts_with("not json at all"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
