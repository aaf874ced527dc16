//! Prompt construction for design requests

use core_pipeline::DesignRequest;

/// JSON shape the endpoint is asked to answer with
pub const RESPONSE_SCHEMA: &str = r##"{
  "analysis": "characteristics of the space",
  "colors": [{"hex": "#RRGGBB", "name": "color name", "desc": "why it suits the room"}],
  "layout": "furniture placement guide",
  "items": [{"name": "furniture", "style": "style", "reason": "why it fits"}]
}"##;

/// Build the prompt text for a request
///
/// The output depends only on the three free-text parameters and the
/// response language, so every attempt of a submission sends the same
/// prompt.
pub fn build_prompt(request: &DesignRequest, response_language: Option<&str>) -> String {
    let mut prompt = format!(
        r#"You are a senior interior designer.
Analyze the attached photo of a room together with the client's requests and propose a tasteful interior design solution.

Room area: {}
Furniture needed: {}
Desired mood / style: {}

Respond with JSON only, using exactly this format:
{}

Every "hex" value must be a # followed by six hexadecimal digits."#,
        or_unspecified(request.area()),
        or_unspecified(request.furniture()),
        or_unspecified(request.mood()),
        RESPONSE_SCHEMA
    );

    if let Some(language) = response_language.map(str::trim).filter(|l| !l.is_empty()) {
        prompt.push_str(&format!(
            "\nWrite all free-text values in {}; keep the JSON keys in English.",
            language
        ));
    }

    prompt
}

fn or_unspecified(text: &str) -> &str {
    let text = text.trim();
    if text.is_empty() {
        "not specified"
    } else {
        text
    }
}
